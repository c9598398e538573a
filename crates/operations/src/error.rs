use crate::Family;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
	#[error("operation type <{type_name}> registered twice, first as a {first}, then as a {second}")]
	DuplicateOperation {
		type_name: &'static str,
		first: Family,
		second: Family,
	},
	#[error("operation type can't be empty")]
	EmptyType,
}

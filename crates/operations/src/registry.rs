use crate::{Message, Mutation, Query, RegistryError};

use std::{any::Any, collections::HashMap, fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use td_core_shared_types::{ErrorKind, ErrorObject};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Family {
	Query,
	Mutation,
	Message,
}

#[async_trait]
trait ErasedHandler<Ctx>: Send + Sync {
	async fn call(&self, ctx: &Ctx, input: Value) -> Result<Value, ErrorObject>;
}

struct QueryEntry<Q>(Arc<Q>);
struct MutationEntry<M>(Arc<M>);
struct MessageEntry<G>(Arc<G>);

#[async_trait]
impl<Ctx: Send + Sync + 'static, Q: Query<Ctx>> ErasedHandler<Ctx> for QueryEntry<Q> {
	async fn call(&self, ctx: &Ctx, input: Value) -> Result<Value, ErrorObject> {
		let input = decode_input::<Q::Input>(Q::TYPE, input)?;
		let output = self.0.execute(ctx, input).await?;
		encode_output(Q::TYPE, &output)
	}
}

#[async_trait]
impl<Ctx: Send + Sync + 'static, M: Mutation<Ctx>> ErasedHandler<Ctx> for MutationEntry<M> {
	async fn call(&self, ctx: &Ctx, input: Value) -> Result<Value, ErrorObject> {
		let input = decode_input::<M::Input>(M::TYPE, input)?;
		self.0.validate(&input)?;
		let output = self.0.execute(ctx, input).await?;
		encode_output(M::TYPE, &output)
	}
}

#[async_trait]
impl<Ctx: Send + Sync + 'static, G: Message<Ctx>> ErasedHandler<Ctx> for MessageEntry<G> {
	async fn call(&self, ctx: &Ctx, input: Value) -> Result<Value, ErrorObject> {
		let input = decode_input::<G::Input>(G::TYPE, input)?;
		self.0.handle(ctx, input).await?;
		Ok(Value::Null)
	}
}

struct Entry<Ctx> {
	family: Family,
	erased: Box<dyn ErasedHandler<Ctx>>,
	typed: Arc<dyn Any + Send + Sync>,
}

/// Collects handlers at startup. Consumed by [`RegistryBuilder::build`].
pub struct RegistryBuilder<Ctx> {
	entries: HashMap<&'static str, Entry<Ctx>>,
}

impl<Ctx: Send + Sync + 'static> RegistryBuilder<Ctx> {
	#[must_use]
	pub fn new() -> Self {
		Self {
			entries: HashMap::new(),
		}
	}

	pub fn query<Q: Query<Ctx>>(self, handler: Q) -> Result<Self, RegistryError> {
		let handler = Arc::new(handler);
		self.insert(
			Q::TYPE,
			Family::Query,
			Box::new(QueryEntry(Arc::clone(&handler))),
			handler,
		)
	}

	pub fn mutation<M: Mutation<Ctx>>(self, handler: M) -> Result<Self, RegistryError> {
		let handler = Arc::new(handler);
		self.insert(
			M::TYPE,
			Family::Mutation,
			Box::new(MutationEntry(Arc::clone(&handler))),
			handler,
		)
	}

	pub fn message<G: Message<Ctx>>(self, handler: G) -> Result<Self, RegistryError> {
		let handler = Arc::new(handler);
		self.insert(
			G::TYPE,
			Family::Message,
			Box::new(MessageEntry(Arc::clone(&handler))),
			handler,
		)
	}

	fn insert(
		mut self,
		type_name: &'static str,
		family: Family,
		erased: Box<dyn ErasedHandler<Ctx>>,
		typed: Arc<dyn Any + Send + Sync>,
	) -> Result<Self, RegistryError> {
		if type_name.is_empty() {
			return Err(RegistryError::EmptyType);
		}

		if let Some(existing) = self.entries.get(type_name) {
			return Err(RegistryError::DuplicateOperation {
				type_name,
				first: existing.family,
				second: family,
			});
		}

		self.entries.insert(
			type_name,
			Entry {
				family,
				erased,
				typed,
			},
		);

		Ok(self)
	}

	#[must_use]
	pub fn build(self) -> Registry<Ctx> {
		debug!(operations_count = self.entries.len(), "Operation registry built");

		Registry {
			entries: self.entries,
		}
	}
}

impl<Ctx: Send + Sync + 'static> Default for RegistryBuilder<Ctx> {
	fn default() -> Self {
		Self::new()
	}
}

/// Immutable lookup table from discriminator to handler.
pub struct Registry<Ctx> {
	entries: HashMap<&'static str, Entry<Ctx>>,
}

impl<Ctx> fmt::Debug for Registry<Ctx> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut types = self.entries.keys().collect::<Vec<_>>();
		types.sort_unstable();
		f.debug_struct("Registry").field("types", &types).finish()
	}
}

impl<Ctx: Send + Sync + 'static> Registry<Ctx> {
	#[must_use]
	pub fn contains(&self, family: Family, type_name: &str) -> bool {
		self.entries
			.get(type_name)
			.is_some_and(|entry| entry.family == family)
	}

	/// Registered discriminators of one family, sorted.
	#[must_use]
	pub fn types(&self, family: Family) -> Vec<&'static str> {
		let mut types = self
			.entries
			.iter()
			.filter(|(_, entry)| entry.family == family)
			.map(|(type_name, _)| *type_name)
			.collect::<Vec<_>>();
		types.sort_unstable();
		types
	}

	/// Dispatches a `{type, ...fields}` request.
	pub async fn dispatch(
		&self,
		ctx: &Ctx,
		family: Family,
		mut request: Value,
	) -> Result<Value, ErrorObject> {
		let Value::Object(fields) = &mut request else {
			return Err(ErrorObject::validation("request must be a JSON object"));
		};

		let type_name = match fields.remove("type") {
			Some(Value::String(type_name)) => type_name,
			Some(_) => return Err(ErrorObject::validation("`type` must be a string")),
			None => return Err(ErrorObject::validation("request is missing `type`")),
		};

		self.dispatch_type(ctx, family, &type_name, request).await
	}

	/// Dispatches by discriminator with the input fields given separately.
	pub async fn dispatch_type(
		&self,
		ctx: &Ctx,
		family: Family,
		type_name: &str,
		input: Value,
	) -> Result<Value, ErrorObject> {
		let entry = self.lookup(family, type_name)?;

		debug!(operation = type_name, %family, "Dispatching operation");
		let start = Instant::now();

		let result = entry.erased.call(ctx, input).await;

		log_outcome(type_name, family, start, result.as_ref().err());

		result
	}

	pub async fn query_json(&self, ctx: &Ctx, request: Value) -> Result<Value, ErrorObject> {
		self.dispatch(ctx, Family::Query, request).await
	}

	pub async fn mutate_json(&self, ctx: &Ctx, request: Value) -> Result<Value, ErrorObject> {
		self.dispatch(ctx, Family::Mutation, request).await
	}

	pub async fn send_json(&self, ctx: &Ctx, request: Value) -> Result<(), ErrorObject> {
		self.dispatch(ctx, Family::Message, request).await.map(|_| ())
	}

	pub async fn query<Q: Query<Ctx>>(
		&self,
		ctx: &Ctx,
		input: Q::Input,
	) -> Result<Q::Output, ErrorObject> {
		let handler = self.typed::<Q>(Family::Query, Q::TYPE)?;
		let start = Instant::now();

		let result = handler.execute(ctx, input).await;

		log_outcome(Q::TYPE, Family::Query, start, result.as_ref().err());
		result
	}

	pub async fn mutate<M: Mutation<Ctx>>(
		&self,
		ctx: &Ctx,
		input: M::Input,
	) -> Result<M::Output, ErrorObject> {
		let handler = self.typed::<M>(Family::Mutation, M::TYPE)?;
		let start = Instant::now();

		let result = match handler.validate(&input) {
			Ok(()) => handler.execute(ctx, input).await,
			Err(e) => Err(e),
		};

		log_outcome(M::TYPE, Family::Mutation, start, result.as_ref().err());
		result
	}

	pub async fn send<G: Message<Ctx>>(&self, ctx: &Ctx, input: G::Input) -> Result<(), ErrorObject> {
		let handler = self.typed::<G>(Family::Message, G::TYPE)?;
		let start = Instant::now();

		let result = handler.handle(ctx, input).await;

		log_outcome(G::TYPE, Family::Message, start, result.as_ref().err());
		result
	}

	fn lookup(&self, family: Family, type_name: &str) -> Result<&Entry<Ctx>, ErrorObject> {
		self.entries
			.get(type_name)
			.filter(|entry| entry.family == family)
			.ok_or_else(|| {
				ErrorObject::new(
					ErrorKind::UnknownOperation,
					format!("no {family} registered as <{type_name}>"),
				)
			})
	}

	fn typed<H: Send + Sync + 'static>(
		&self,
		family: Family,
		type_name: &'static str,
	) -> Result<Arc<H>, ErrorObject> {
		Arc::clone(&self.lookup(family, type_name)?.typed)
			.downcast::<H>()
			.map_err(|_| {
				ErrorObject::new(
					ErrorKind::UnknownOperation,
					format!("<{type_name}> is registered with a different handler"),
				)
			})
	}
}

fn decode_input<I: DeserializeOwned>(type_name: &str, input: Value) -> Result<I, ErrorObject> {
	serde_json::from_value(input)
		.map_err(|e| ErrorObject::validation(format!("invalid input for <{type_name}>: {e}")))
}

fn encode_output<O: Serialize>(type_name: &str, output: &O) -> Result<Value, ErrorObject> {
	serde_json::to_value(output)
		.map_err(|e| ErrorObject::internal(format!("failed to encode output of <{type_name}>: {e}")))
}

fn log_outcome(type_name: &str, family: Family, start: Instant, error: Option<&ErrorObject>) {
	let duration_ms = start.elapsed().as_millis();

	match error {
		None => debug!(operation = type_name, %family, duration_ms, "Operation completed"),
		Some(e) if matches!(e.kind, ErrorKind::NotFound | ErrorKind::Validation) => {
			debug!(operation = type_name, %family, duration_ms, %e, "Operation rejected");
		}
		Some(e) => warn!(operation = type_name, %family, duration_ms, %e, "Operation failed"),
	}
}

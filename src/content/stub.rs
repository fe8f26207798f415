use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::cache::{FetchError, OperationId};

use super::ContentSource;

type Handler = Box<dyn Fn(OperationId, &Value) -> Result<Value, FetchError> + Send + Sync>;

/// Scripted source that records every call it receives.
pub(crate) struct StubSource {
    handler: Handler,
    calls: Mutex<Vec<(OperationId, Value)>>,
}

impl StubSource {
    pub(crate) fn new(
        handler: impl Fn(OperationId, &Value) -> Result<Value, FetchError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers every query with its own operation name and arguments.
    pub(crate) fn echo() -> Self {
        Self::new(|operation, args| Ok(json!({"operation": operation.name(), "args": args})))
    }

    pub(crate) fn calls(&self) -> Vec<(OperationId, Value)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn call_count(&self, operation: OperationId) -> usize {
        self.calls()
            .iter()
            .filter(|(called, _)| *called == operation)
            .count()
    }
}

#[async_trait]
impl ContentSource for StubSource {
    async fn query(&self, operation: OperationId, args: Value) -> Result<Value, FetchError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((operation, args.clone()));
        (self.handler)(operation, &args)
    }
}

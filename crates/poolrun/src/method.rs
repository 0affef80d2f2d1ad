//! # Method Wrapper
//!
//! Calls one named method of a replicated model on whichever instance is free.

use anyhow::anyhow;

use crate::interpreter::Value;
use crate::pool;
use crate::registry::ARGUMENT_NAMES_FUNC;
use crate::registry::ARGUMENT_NAMES_MODULE;
use crate::replicated::Replicated;
use crate::session;

#[derive(Clone, Debug)]
pub struct MethodWrapper {
    model: Replicated,
    method: String,
}

impl MethodWrapper {
    pub fn new(model: Replicated, method: impl Into<String>) -> Self {
        Self {
            model,
            method: method.into(),
        }
    }

    pub fn model(&self) -> &Replicated {
        &self.model
    }

    pub fn name(&self) -> &str {
        &self.method
    }

    /// Declared parameter names of the method, as reported by the runtime.
    pub fn argument_names(&self) -> pool::Result<Vec<String>> {
        let session = self.model.acquire_session(None)?;
        let Some(model) = session.self_obj() else {
            return Err(session::Error::Runtime(anyhow!("session opened without its model")).into());
        };
        let method = model.attr(&self.method)?;
        let names = session
            .global(ARGUMENT_NAMES_MODULE, ARGUMENT_NAMES_FUNC)?
            .call(&[method])?
            .to_value()?;

        let items = match names {
            Value::List(items) => items,
            other => {
                return Err(session::Error::Runtime(anyhow!("expected a list of names, got {:?}", other)).into());
            }
        };
        items
            .into_iter()
            .map(|item| -> pool::Result<String> {
                match item {
                    Value::Str(name) => Ok(name),
                    other => Err(session::Error::Runtime(anyhow!("expected a parameter name, got {:?}", other)).into()),
                }
            })
            .collect()
    }

    /// Calls `model.<method>(*args)` and converts the result to plain data.
    pub fn call(&self, args: Vec<Value>) -> pool::Result<Value> {
        let session = self.model.acquire_session(None)?;
        let Some(model) = session.self_obj() else {
            return Err(session::Error::Runtime(anyhow!("session opened without its model")).into());
        };
        let result = model.attr(&self.method)?.call_values(args)?.to_value()?;
        Ok(result)
    }
}

//! Fault boundary for hook and spec bodies
//!
//! Every user-supplied step runs inside [`run_guarded`]. A returned error and
//! a panic both come back as a [`StepFault`]; neither escapes to the node.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// A step that returned an error or panicked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFault {
    pub step: String,
    pub cause: String,
    pub is_panic: bool,
}

impl StepFault {
    /// A failure that did not come from a panic (transport, leader signal)
    pub fn failure(step: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            cause: cause.into(),
            is_panic: false,
        }
    }
}

impl fmt::Display for StepFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_panic {
            write!(f, "step \"{}\" panicked: {}", self.step, self.cause)
        } else {
            write!(f, "step \"{}\" failed: {}", self.step, self.cause)
        }
    }
}

/// Run `body`, converting an `Err` or a panic into a [`StepFault`]
pub fn run_guarded<T>(step: &str, body: impl FnOnce() -> anyhow::Result<T>) -> Result<T, StepFault> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(StepFault {
            step: step.to_string(),
            cause: format!("{:#}", err),
            is_panic: false,
        }),
        Err(panic_payload) => Err(StepFault {
            step: step.to_string(),
            cause: panic_message(panic_payload.as_ref()),
            is_panic: true,
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

//! Script host contract.
//!
//! One host per dialect. A host evaluates source text in a fresh
//! interpreter and returns what the entry point produced: a ready
//! capability instance or a single-argument callable.

use crate::behavior::capability::BehaviorHandle;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Name of the binding a script must define.
pub const SCRIPT_ENTRY_POINT: &str = "instantiate";

pub trait ScriptHost: Send + Sync {
    /// Dialect tag this host answers to (matched case-insensitively).
    fn dialect(&self) -> &str;

    /// Evaluates `source` and returns the value bound to
    /// [`SCRIPT_ENTRY_POINT`].
    fn evaluate(&self, source: &str) -> Result<BehaviorHandle, ScriptError>;
}

impl std::fmt::Debug for dyn ScriptHost {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScriptHost({})", self.dialect())
    }
}

/// Script evaluation failure reported by a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    MissingEntryPoint,
    Evaluation(String),
}

impl Display for ScriptError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEntryPoint => {
                write!(f, "script does not define `{SCRIPT_ENTRY_POINT}`")
            }
            Self::Evaluation(message) => write!(f, "script evaluation failed: {message}"),
        }
    }
}

impl Error for ScriptError {}

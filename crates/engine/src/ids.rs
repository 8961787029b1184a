//! Entity and resource identifiers.
//!
//! Every identifier is an opaque random token, string-rendered, never reused.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! random_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Allocate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

macro_rules! name_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

random_id! {
    /// Identifies one workflow instance.
    WorkflowId
}

random_id! {
    /// Identifies one task instance.
    TaskId
}

random_id! {
    /// Identifies one running branch of a workflow.
    BranchId
}

random_id! {
    /// Identifies one decision cycle.
    DecisionId
}

random_id! {
    /// Identifies one pending delay.
    DelayId
}

random_id! {
    /// Identifies one awaited external event.
    EventId
}

name_id! {
    /// User-facing workflow type name.
    WorkflowName
}

name_id! {
    /// User-facing task type name.
    TaskName
}

name_id! {
    /// Name of a workflow entry point.
    BranchName
}

name_id! {
    /// Name of an external event channel.
    EventName
}

name_id! {
    /// Name of a workflow variable.
    PropertyName
}

name_id! {
    /// Job name used for per-name monitoring aggregation.
    JobName
}

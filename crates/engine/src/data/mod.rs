//! Execution-tree data model: branches, steps, commands, properties.

pub mod branches;
pub mod commands;
pub mod properties;
pub mod steps;

pub use branches::{Branch, BranchInput};
pub use commands::{Command, CommandStatus};
pub use properties::{Properties, PropertyHash, PropertyStore, PropertyValue};
pub use steps::{Step, WaitTree};

//! Statecraft: hierarchical, concurrent state machine execution
//!
//! A state machine is a tree of [`State`]s. Leaves run user scripts;
//! containers sequence their children (hierarchy states) or run them side
//! by side (preemptive and barrier concurrency states). Library states embed
//! a private copy of a shared template.
//!
//! Data moves along typed ports, control moves along outcome transitions,
//! and preemption is cooperative: stopping a state cancels the token its
//! subtree observes.
//!
//! # Core Concepts
//!
//! - **State**: a node with ports, outcomes and, for containers, children
//! - **Transitions**: map a child's outcome to the next child or to a
//!   container outcome
//! - **Data flows**: connect output ports to input ports inside a container
//! - **Execution**: [`execution::StateMachineExecutor`] runs a root tree to
//!   a final outcome
//!
//! # Example
//!
//! ```rust
//! use statecraft::builder::StateBuilder;
//! use statecraft::core::{DataType, IdAllocator, SUCCESS};
//! use statecraft::execution::{script_fn, ExecutionConfig, ScriptContext, ScriptError, StateMachineExecutor};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let ids = IdAllocator::new();
//! let double = script_fn(|ctx: ScriptContext| async move {
//!     let x: i64 = ctx.input_as("x")?;
//!     ctx.set_output("y", json!(x * 2));
//!     Ok::<_, ScriptError>(SUCCESS)
//! });
//!
//! let root = StateBuilder::hierarchy("root")
//!     .input("x", DataType::Int, None)
//!     .output("y", DataType::Int, None)
//!     .child(
//!         StateBuilder::execution("double", double)
//!             .input("x", DataType::Int, None)
//!             .output("y", DataType::Int, None),
//!     )
//!     .exit("double", "success", "success")
//!     .data_flow(".", "x", "double", "x")
//!     .data_flow("double", "y", ".", "y")
//!     .build(&ids)
//!     .unwrap();
//!
//! let executor = StateMachineExecutor::new(root, ExecutionConfig::default());
//! let outcome = executor.run_to_completion(Some(json!({ "x": 21 }))).await.unwrap();
//! assert_eq!(outcome.id, SUCCESS);
//! assert_eq!(executor.root().runtime_output()["y"], json!(42));
//! # }
//! ```

pub mod builder;
pub mod core;
pub mod document;
pub mod execution;
pub mod validation;

// Re-export commonly used types
pub use builder::StateBuilder;
pub use core::{IdAllocator, Outcome, State, StateError, StateKind};
pub use execution::{RunContext, StateMachineExecutor};

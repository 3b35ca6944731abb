//! The `biosim_core` crate provides the math container used to simulate
//! biochemical reaction networks.
//!
//! A model (compartments, species, global quantities, reactions, moieties
//! and events) is compiled into a single value arena with a parallel table
//! of object descriptors. Integrators then drive the container through its
//! state, rate, root and event-queue operations.
//!
//! Key components:
//! - **Arena**: segmented value storage addressed by relocatable `ObjectIndex` handles.
//! - **Equation Engine**: parser and bytecode VM for model expressions.
//! - **Graph**: dependency graphs producing ordered update sequences.
//! - **Container**: the compile pipeline plus simulation, event and delay runtime.
//! - **Jacobian**: central-difference Jacobians of rates and root functions.
pub mod arena;
pub mod config;
pub mod container;
pub mod delay;
pub mod discontinuity;
pub mod equation_engine;
pub mod error;
pub mod event;
pub mod event_queue;
pub mod expression;
pub mod graph;
pub mod jacobian;
pub mod model;
pub mod object;
pub mod relocation;
pub mod symbols;
pub mod traits;

pub use config::ContainerSettings;
pub use container::{CompileState, ContainerSystem, MathContainer};
pub use error::{MathError, Result};
pub use event::RootToggle;
pub use model::{EntityStatus, EventDefinition, Model};
pub use object::{DataObjectKey, EntityKey, ObjectIndex, Quantity};

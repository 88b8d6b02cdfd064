//! Equation-graph engine for batched, discrete-time system-dynamics simulation.
//!
//! A [`Model`] holds named references (Variables, Flows, Stocks, Metrics and
//! the time reference `t`), each defined by an expression tree. Running a
//! model evaluates every reference once per timestep for a whole batch of
//! samples, accumulating Stocks from the previous step's flows.
//!
//! ```
//! use stockflow_core::prelude::*;
//!
//! let mut model = Model::new("tub").with_steps(5);
//! let water = model.attach("water", RefSpec::stock().init(10.0)).unwrap();
//! let drain = model.flow("drain").unwrap();
//! model.set_equation(drain, water * 0.5).unwrap();
//! model.connect_outflow(water, drain).unwrap();
//!
//! let output = model.run(&Bindings::new(), &RunConfig::new()).unwrap();
//! assert_eq!(output["water"].at(0, 1), 5.0);
//! ```

pub mod analysis;
pub mod compute;
pub mod display;
pub mod error;
pub mod graph;
pub mod store;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::compute::{sweep, Bindings, Dtype, RunConfig, RunOutput, Series, SimulationError, Simulator};
    pub use crate::graph::ops::*;
    pub use crate::graph::{Distribution, Expr, GraphError, ParseError};
    pub use crate::store::{Model, RefId, RefKind, RefSpec};
}

//! The crate-level error, for callers that mix building, running and persistence.
use crate::compute::SimulationError;
use crate::graph::{GraphError, ParseError};
use crate::store::SerialError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    Serial(#[from] SerialError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{Bindings, RunConfig};
    use crate::store::Model;

    fn build_and_run() -> Result<f64> {
        let mut model = Model::new("mixed");
        model.variable("x", 2.0)?;
        let y = model.parse("(* x Scalar(3))")?;
        model.variable("y", y)?;
        model.free_variable("z")?;
        let output = model.run(&Bindings::new(), &RunConfig::new())?;
        Ok(output["y"].at(0, 0))
    }

    #[test]
    fn test_question_mark_across_layers() {
        let err = build_and_run().unwrap_err();
        assert!(matches!(err, Error::Simulation(SimulationError::UnresolvedFreeVariable { .. })));
        assert_eq!(err.to_string(), "Free variable 'z' has no binding");
    }
}

use auto_impl::auto_impl;

use crate::hlo::Module;

/// A graph-to-graph transformation over a [Module].
#[auto_impl(&, Box)]
pub trait HloPass {
    type Error: std::error::Error;

    fn name(&self) -> &'static str;

    /// Runs the pass, returning whether the module changed.
    fn run(&self, module: &mut Module) -> Result<bool, Self::Error>;
}

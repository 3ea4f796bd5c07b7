use crate::{Result, Tensor};

/// Base trait for all layers.
///
/// Parameter names are dotted paths relative to the module
/// (`"layers.0.stu.M_phi_plus"`), matching the names a state dict would use.
pub trait Module: Send + Sync {
    /// Forward pass.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Named views of every trainable tensor.
    fn named_parameters(&self) -> Vec<(String, &Tensor)>;

    /// Mutable access for an external optimizer or initialiser.
    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)>;

    /// All trainable tensors, in `named_parameters` order.
    fn parameters(&self) -> Vec<&Tensor> {
        self.named_parameters().into_iter().map(|(_, t)| t).collect()
    }

    /// Total number of trainable scalars.
    fn num_params(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.numel()).sum()
    }

    /// Set training/eval mode.
    fn train(&mut self, _mode: bool) {}

    /// Whether the module is in training mode.
    fn is_training(&self) -> bool {
        false
    }
}

/// Prefix every name in `params` with `prefix.`.
pub fn prefixed<'a>(prefix: &str, params: Vec<(String, &'a Tensor)>) -> Vec<(String, &'a Tensor)> {
    params
        .into_iter()
        .map(|(name, t)| (format!("{prefix}.{name}"), t))
        .collect()
}

/// Mutable counterpart of [`prefixed`].
pub fn prefixed_mut<'a>(
    prefix: &str,
    params: Vec<(String, &'a mut Tensor)>,
) -> Vec<(String, &'a mut Tensor)> {
    params
        .into_iter()
        .map(|(name, t)| (format!("{prefix}.{name}"), t))
        .collect()
}

//! Gaussian map state: primitives, their arena, the optimizer over it,
//! the renderer boundary and the loss.

pub mod init;
pub mod loss;
pub mod optimizer;
pub mod primitive;
pub mod renderer;
pub mod store;

pub use loss::{compute_loss, LossSettings, LossTerms, Reduction};
pub use optimizer::{adam_update, AdamConfig, PrimitiveOptimizer};
pub use primitive::{Primitive, PARAM_DIM};
pub use renderer::{Gradients, ImageGradients, PoseGrad, RenderError, RenderOutput, Renderer};
pub use store::{PrimitiveEntry, PrimitiveGrad, PrimitiveHandle, PrimitiveState, PrimitiveStore};

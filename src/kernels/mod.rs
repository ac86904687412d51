//! Device kernels used by graph nodes.
//!
//! Each function enqueues one launch on the given stream and returns
//! immediately. Pointers are read and written when the launch executes, so
//! they must stay valid until the stream has passed it.

mod noise;
mod points;
mod rays;
mod rng;

pub use noise::{add_gaussian_noise_angular_hitpoint, setup_gaussian_noise_generator};
pub use points::{compute_distances, fill_ray_indices, transform_points};
pub use rays::transform_rays;
pub use rng::PcgState;

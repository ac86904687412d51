//! Concrete pipeline stages.

mod from_array_points;
mod gaussian_noise;
mod rays_from_mat3x4;
mod raytrace;
mod transform_points;
mod transform_rays;

pub use from_array_points::FromArrayPointsNode;
pub use gaussian_noise::GaussianNoiseAngularHitpointNode;
pub use rays_from_mat3x4::RaysFromMat3x4Node;
pub use raytrace::RaytraceNode;
pub use transform_points::TransformPointsNode;
pub use transform_rays::TransformRaysNode;

mod activation;
mod audit_log;
mod license;
mod subscription;

pub use activation::*;
pub use audit_log::*;
pub use license::*;
pub use subscription::*;

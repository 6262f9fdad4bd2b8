pub use crate::error::ProviderError;
pub use crate::models::*;
pub use crate::traits::Provider;

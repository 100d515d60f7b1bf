pub mod factory;
pub mod wrapper;

pub use factory::{CoordinatedStoreFactory, LocalStoreFactory, ScopedStoreFactory};
pub use wrapper::{GUEST_PREFIX, UserScopeWrapper, scoped_key, validate_namespace};

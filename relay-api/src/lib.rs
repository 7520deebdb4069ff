pub mod handlers;
pub mod identity;
pub mod server;

pub use identity::{AuthenticatedUser, USER_ID_HEADER};
pub use server::{router, run};

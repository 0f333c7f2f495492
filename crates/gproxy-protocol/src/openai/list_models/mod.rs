pub mod request;
pub mod response;

pub use request::ListModelsRequest;
pub use response::{ListModelsResponse, ListObjectType};

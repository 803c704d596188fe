pub mod register;
pub mod validation;

pub use register::{RegisterRequest, RegisterRequestError};
pub use validation::{
    map_response, IdentityClient, IdentityError, TransientReason, ValidationError,
    ValidationResult,
};

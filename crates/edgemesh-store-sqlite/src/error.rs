//! Maps `sqlx::Error` onto `edgemesh_core::CoreError`. A plain function
//! rather than a `From` impl: neither type is local to this crate, so the
//! orphan rules rule out implementing the trait here.

use edgemesh_core::CoreError;

pub fn map_sqlx_error(err: sqlx::Error) -> CoreError {
    CoreError::Internal(err.to_string())
}

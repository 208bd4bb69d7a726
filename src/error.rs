use std::any::Any;

/// Trait for errors that may be returned from the operator's public api. This just sets up the
/// trait bounds that are required, since we'll typically only expose rather opaque boxed
/// error types, and they will need to be sent between threads.
pub trait OperatorError: std::error::Error + Send + 'static + Any {
    fn as_any(&self) -> &dyn Any;
}
impl<T> OperatorError for T
where
    T: std::error::Error + Send + 'static + Any,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type Error = Box<dyn OperatorError>;

impl dyn OperatorError {
    /// convenience function for downcasting the error to a concrete type
    pub fn as_type<T: OperatorError>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// convenience function for checking whether the error is of the given concrete type.
    /// If `is_type::<MyType>()` returns true, then calling `as_type::<MyType>()` will return
    /// `Some`.
    pub fn is_type<T: OperatorError>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl<T> From<T> for Error
where
    T: OperatorError,
{
    fn from(e: T) -> Error {
        Box::new(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::InvalidResourceError;

    #[test]
    fn boxed_error_can_be_downcast_to_its_concrete_type() {
        let err: Error =
            InvalidResourceError::new("missing metadata.uid", serde_json::Value::Null).into();
        assert!(err.is_type::<InvalidResourceError>());
        assert!(!err.is_type::<std::io::Error>());
        let concrete = err.as_type::<InvalidResourceError>().expect("downcast failed");
        assert_eq!("missing metadata.uid", concrete.message);
    }
}

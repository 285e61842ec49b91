use std::any::Any;

/// Trait for errors that escape the controllers, such as runner startup failures and
/// configuration errors. It only sets up the trait bounds that are required to pass a boxed
/// error between tasks while still being able to downcast it.
pub trait ControllerError: std::error::Error + Send + Sync + 'static + Any {
    fn as_any(&self) -> &dyn Any;
}
impl<T> ControllerError for T
where
    T: std::error::Error + Send + Sync + 'static + Any,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type Error = Box<dyn ControllerError>;

impl dyn ControllerError {
    /// convenience function for downcasting the error to a concrete type
    pub fn as_type<T: ControllerError>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// If `is_type::<MyType>()` returns true, then calling `as_type::<MyType>()` will return `Some`.
    pub fn is_type<T: ControllerError>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl<T> From<T> for Error
where
    T: ControllerError,
{
    fn from(e: T) -> Error {
        Box::new(e)
    }
}

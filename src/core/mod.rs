pub mod array;
pub mod dispatch;
pub mod variant;

pub use array::{ArrayRef, VbArray};
pub use dispatch::{Dispatch, DispatchError, DispatchResult, Member, ObjectRef};
pub use variant::Variant;

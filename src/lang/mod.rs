pub mod object;
pub mod value;

pub use object::Obj;
pub use value::{Bitmap256, Place, Value};

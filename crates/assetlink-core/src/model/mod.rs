//! The digital-twin side of the framework: what is addressed and what values
//! look like.

pub mod datatype;
pub mod operation;
pub mod reference;
pub mod type_info;
pub mod value;

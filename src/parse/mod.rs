// Export types so one can import only types without the rest of the module.
pub mod types;
// The byte cursor the parser (and the data image) run on.
pub mod reader;
// Only contains Parser, so re-export it in this module.
mod parser;
// Only contains ParsingError, so re-export in this module.
mod error;

pub use types::*;
pub use reader::{ByteReader, SeekOrigin};
pub use error::ParsingError;
pub use parser::Parser;

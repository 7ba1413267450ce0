use thiserror::Error;
use crate::parse::{ParsingError, ValueType};

#[derive(Debug, Error)]
pub enum DisassemblyError {
	#[error("element section is present but contains no segments")]
	EmptyElementSection,

	#[error("global {index} has unsupported content type {content_type:?}")]
	UnsupportedGlobalType {
		index: usize,
		content_type: ValueType,
	},

	#[error("type index {index} out of bounds for length {len}")]
	TypeIndexOutOfRange {
		index: usize,
		len: usize,
	},

	#[error("function index {index} out of bounds for length {len}")]
	FunctionIndexOutOfRange {
		index: usize,
		len: usize,
	},

	#[error("ParsingError: {0}")]
	Parsing(#[from] ParsingError),
}

use std::io;
use thiserror::Error;
use num_enum::TryFromPrimitiveError;
use crate::parse::types::ValueType;

#[derive(Debug, Error)]
pub enum ParsingError {
	#[error("not a WebAssembly v1 module")]
	InvalidModule,

	#[error("read beyond the end of the stream")]
	UnexpectedEndOfStream,

	#[error("LEB128 encoding does not fit the requested width")]
	InvalidLeb128,

	#[error("invalid section id: {0}")]
	InvalidSectionId(u32),

	#[error("invalid import kind: {0}")]
	InvalidImportKind(u8),

	#[error("invalid export kind: {0}")]
	InvalidExportKind(u8),

	#[error("unknown value type: {0}")]
	UnknownValueType(#[from] TryFromPrimitiveError<ValueType>),

	#[error("IoError: {0}")]
	IoError(#[from] io::Error),
}

impl From<leb128::read::Error> for ParsingError {
	fn from(err: leb128::read::Error) -> Self {
		match err {
			leb128::read::Error::Overflow => ParsingError::InvalidLeb128,
			leb128::read::Error::IoError(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
				ParsingError::UnexpectedEndOfStream
			}
			leb128::read::Error::IoError(err) => ParsingError::IoError(err),
		}
	}
}

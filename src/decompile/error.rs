use thiserror::Error;
use num_enum::TryFromPrimitiveError;
use crate::decompile::opcode::{Opcode, TruncSatOp};
use crate::disasm::DisassemblyError;
use crate::parse::{ParsingError, ValueType};

#[derive(Debug, Error)]
pub enum DecompileError {
	#[error("invalid opcode: {0}")]
	InvalidOpcode(#[from] TryFromPrimitiveError<Opcode>),

	#[error("invalid saturating truncation selector: {0}")]
	InvalidTruncSatSelector(#[from] TryFromPrimitiveError<TruncSatOp>),

	#[error("local of unsupported type {0:?}")]
	UnexpectedLocalType(ValueType),

	#[error("decompiler used in an invalid state: {0}")]
	InvalidState(&'static str),

	#[error("pop was called on an empty operand stack")]
	PopOnEmptyOperandStack,

	#[error("local index {index} out of bounds for length {len}")]
	LocalIndexOutOfRange {
		index: usize,
		len: usize,
	},

	#[error("global index {index} out of bounds for length {len}")]
	GlobalIndexOutOfRange {
		index: usize,
		len: usize,
	},

	#[error("branch depth {depth} exceeds {len} open branches")]
	BranchDepthOutOfRange {
		depth: u32,
		len: usize,
	},

	#[error("DisassemblyError: {0}")]
	Disassembly(#[from] DisassemblyError),

	#[error("ParsingError: {0}")]
	Parsing(#[from] ParsingError),
}

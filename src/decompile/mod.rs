// The MVP opcode table shared by both renderers.
pub mod opcode;
// The symbolic operand stack entries of the structured renderer.
pub mod expression;
// One module per renderer.
mod flat;
mod structured;
// Only contains DecompileError, so re-export in this module.
mod error;

pub use opcode::{Opcode, TruncSatOp};
pub use expression::{Expression, ExpressionKind, Operand};
pub use error::DecompileError;
pub use flat::FlatDecompiler;
pub use structured::StructuredDecompiler;

use crate::disasm::{Disassembler, Function, Global, Local};
use crate::parse::ValueType;

/// A renderer turning lifted functions into text. Output accumulates in the
/// instance and is handed out (and cleared) by
/// [build_output](Decompiler::build_output).
pub trait Decompiler {
	/// Emits the module preamble and acquires per-module resources.
	fn prepare(&mut self) -> Result<(), DecompileError>;

	fn decompile_function(&mut self, function: &Function) -> Result<(), DecompileError>;

	/// Returns the accumulated output and clears the buffer.
	fn build_output(&mut self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompilerKind {
	Flat,
	Structured,
}

/// Runs the chosen renderer over every lifted function of the module.
pub fn decompile(
	disassembler: &Disassembler,
	kind: DecompilerKind,
) -> Result<String, DecompileError> {
	match kind {
		DecompilerKind::Flat => run(FlatDecompiler::new(disassembler), disassembler),
		DecompilerKind::Structured => run(StructuredDecompiler::new(disassembler), disassembler),
	}
}

fn run(
	mut decompiler: impl Decompiler,
	disassembler: &Disassembler,
) -> Result<String, DecompileError> {
	decompiler.prepare()?;
	for function in disassembler.functions() {
		decompiler.decompile_function(function)?;
	}
	Ok(decompiler.build_output())
}

pub(crate) fn local_at(function: &Function, index: usize) -> Result<&Local, DecompileError> {
	function.locals.get(index).ok_or(DecompileError::LocalIndexOutOfRange {
		index,
		len: function.locals.len(),
	})
}

pub(crate) fn global_at(
	disassembler: &Disassembler,
	index: usize,
) -> Result<&Global, DecompileError> {
	disassembler.globals().get(index).ok_or(DecompileError::GlobalIndexOutOfRange {
		index,
		len: disassembler.globals().len(),
	})
}

/// The local declaration initializer of the structured renderer.
pub(crate) fn zero_value(value_type: ValueType) -> Result<&'static str, DecompileError> {
	match value_type {
		ValueType::I32 | ValueType::I64 => Ok("0"),
		ValueType::F32 | ValueType::F64 => Ok("0.0F"),
		other => Err(DecompileError::UnexpectedLocalType(other)),
	}
}

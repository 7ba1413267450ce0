//! An interactive decompiler for WebAssembly v1 binary modules.
//!
//! The pipeline has three stages: [parse] reads the binary into raw, typed
//! sections; [disasm] lifts them into named functions, decoded globals and a
//! merged data image; [decompile] renders the result either as a flat
//! assembly-like listing or as structured pseudocode.

pub mod parse;
pub mod disasm;
pub mod decompile;

use thiserror::Error;

/// Any failure of the pipeline, for callers that run it end to end.
#[derive(Debug, Error)]
pub enum Error {
	#[error("ParsingError: {0}")]
	Parsing(#[from] parse::ParsingError),

	#[error("DisassemblyError: {0}")]
	Disassembly(#[from] disasm::DisassemblyError),

	#[error("DecompileError: {0}")]
	Decompile(#[from] decompile::DecompileError),
}

/// Parses, disassembles and renders `bytecode` in one go.
pub fn decompile_module(
	bytecode: Vec<u8>,
	kind: decompile::DecompilerKind,
) -> Result<String, Error> {
	let module = parse::Module::new(bytecode)?;
	let mut disassembler = disasm::Disassembler::new(module)?;
	disassembler.disassemble_all()?;
	Ok(decompile::decompile(&disassembler, kind)?)
}

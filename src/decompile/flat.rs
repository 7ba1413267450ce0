use tracing::debug_span;
use crate::decompile::opcode::{Opcode, TruncSatOp};
use crate::decompile::{global_at, local_at, DecompileError, Decompiler};
use crate::disasm::{DataImage, Disassembler, Function, XrefTracker};
use crate::parse::{ByteReader, ExternalKind, ParsingError, ValueType};

/// Assembly-like listing: one opcode per line, prefixed with a module-wide
/// program counter, operands resolved to names.
pub struct FlatDecompiler<'m> {
	disasm: &'m Disassembler,
	image: Option<DataImage>,
	xrefs: XrefTracker,
	output: String,
	pc: u64,
}

impl<'m> FlatDecompiler<'m> {
	pub fn new(disasm: &'m Disassembler) -> Self {
		FlatDecompiler {
			disasm,
			image: None,
			xrefs: XrefTracker::default(),
			output: String::new(),
			pc: 0,
		}
	}

	/// The call edges recorded while rendering.
	pub fn xrefs(&self) -> &XrefTracker {
		&self.xrefs
	}

	fn push_line(&mut self, line: &str) {
		self.output.push_str(line);
		self.output.push('\n');
	}

	/// C-style signature without any prefix or suffix.
	fn signature(function: &Function) -> String {
		let params = function
			.parameters()
			.map(|local| format!("{} {}", Disassembler::type_name(local.value_type), local.name))
			.collect::<Vec<_>>()
			.join(", ");
		format!(
			"{} {}({})",
			Disassembler::type_name(function.return_type),
			function.name,
			params,
		)
	}

	/// `block`, `loop` and `if` carry a block type byte; it is suppressed in
	/// the listing when the block has no result.
	fn block_type_operand(reader: &mut ByteReader) -> Result<String, DecompileError> {
		let block_type = read_block_type(reader)?;
		Ok(match block_type {
			ValueType::EmptyBlock => String::new(),
			other => format!(" {}", Disassembler::type_name(other)),
		})
	}

	fn memory_access_operand(
		&mut self,
		reader: &mut ByteReader,
	) -> Result<String, DecompileError> {
		let flags = reader.read_uleb128()?;
		let offset = reader.read_uleb128()?;
		let mut operand = format!("{:08X}h [align={}]", offset, flags);
		let image = self
			.image
			.as_mut()
			.ok_or(DecompileError::InvalidState("no active data image"))?;
		if image.range_containing(offset).is_some() {
			operand.push_str(&format!(" ; {}", image.make_readable_data_info(offset)?));
		}
		Ok(operand)
	}

	fn decompile_body(
		&mut self,
		function: &Function,
		body: &[u8],
	) -> Result<(), DecompileError> {
		let disasm = self.disasm;
		let mut reader = ByteReader::new(body.to_vec());
		while reader.pos() < body.len() {
			let offset = reader.pos();
			let opcode = Opcode::try_from(reader.read_u8()?)?;
			let pc = self.pc + offset as u64;
			match opcode {
				Opcode::End => {
					// The closing `end` of the body carries no information.
					if offset + 1 < body.len() {
						self.push_line(&format!("{:08X}\tend", pc));
					}
				}
				Opcode::Block => {
					let operand = Self::block_type_operand(&mut reader)?;
					self.push_line(&format!("label_{:08X}:\tblock{}", offset, operand));
				}
				Opcode::Loop | Opcode::If => {
					let operand = Self::block_type_operand(&mut reader)?;
					self.push_line(&format!("{:08X}\t{}{}", pc, opcode.mnemonic(), operand));
				}
				Opcode::Br | Opcode::BrIf => {
					let target = reader.read_uleb128()?;
					self.push_line(&format!("{:08X}\t{} {}", pc, opcode.mnemonic(), target));
				}
				Opcode::BrTable => {
					let count = reader.read_uleb128()?;
					let mut targets = Vec::with_capacity(count as usize + 1);
					for _ in 0..count {
						targets.push(reader.read_uleb128()?.to_string());
					}
					targets.push(reader.read_uleb128()?.to_string());
					self.push_line(&format!("{:08X}\tbr_table {}", pc, targets.join(" ")));
				}
				Opcode::Call => {
					let callee = reader.read_uleb128()?;
					let xref = disasm.find_refs_from_call_fn(function.index, callee, offset as u32)?;
					self.xrefs.record(xref);
					let name = &disasm.function(callee)?.name;
					self.push_line(&format!("{:08X}\tcall {}", pc, name));
				}
				Opcode::CallIndirect => {
					let type_index = reader.read_uleb128()?;
					disasm.func_type(type_index)?;
					reader.read_u8()?; // reserved
					self.push_line(&format!("{:08X}\tcall_indirect {}", pc, type_index));
				}
				Opcode::GetLocal | Opcode::SetLocal | Opcode::TeeLocal => {
					let index = reader.read_uleb128()? as usize;
					let local = local_at(function, index)?;
					self.push_line(&format!("{:08X}\t{} {}", pc, opcode.mnemonic(), local.name));
				}
				Opcode::GetGlobal | Opcode::SetGlobal => {
					let index = reader.read_uleb128()? as usize;
					let global = global_at(disasm, index)?;
					self.push_line(&format!("{:08X}\t{} {}", pc, opcode.mnemonic(), global.name));
				}
				Opcode::CurrentMemory | Opcode::GrowMemory => {
					reader.read_u8()?; // reserved
					self.push_line(&format!("{:08X}\t{}", pc, opcode.mnemonic()));
				}
				Opcode::I32Const => {
					let value = reader.read_sleb128()?;
					self.push_line(&format!("{:08X}\ti32_const {}", pc, value));
				}
				Opcode::I64Const => {
					let value = reader.read_sleb128_64()?;
					self.push_line(&format!("{:08X}\ti64_const {}", pc, value));
				}
				Opcode::F32Const => {
					let value = reader.read_i32()?;
					self.push_line(&format!("{:08X}\tf32_const {}", pc, value));
				}
				Opcode::F64Const => {
					let value = reader.read_i64()?;
					self.push_line(&format!("{:08X}\tf64_const {}", pc, value));
				}
				Opcode::TruncSatPrefix => {
					let selector = TruncSatOp::try_from(reader.read_u8()?)?;
					self.push_line(&format!("{:08X}\t{}", pc, selector.mnemonic()));
				}
				memory_access if is_memory_access(memory_access) => {
					let operand = self.memory_access_operand(&mut reader)?;
					self.push_line(&format!("{:08X}\t{} {}", pc, memory_access.mnemonic(), operand));
				}
				plain => self.push_line(&format!("{:08X}\t{}", pc, plain.mnemonic())),
			}
		}
		Ok(())
	}
}

fn is_memory_access(opcode: Opcode) -> bool {
	(Opcode::I32Load as u8..=Opcode::I64Store32 as u8).contains(&(opcode as u8))
}

fn read_block_type(reader: &mut ByteReader) -> Result<ValueType, DecompileError> {
	let byte = reader.read_u8()?;
	Ok(ValueType::try_from(byte).map_err(ParsingError::from)?)
}

impl Decompiler for FlatDecompiler<'_> {
	fn prepare(&mut self) -> Result<(), DecompileError> {
		let mut preamble = false;
		for global in self.disasm.globals() {
			self.output.push_str(&format!("static {} = {};\n", global.name, global.value));
			preamble = true;
		}
		for export in self.disasm.exports() {
			if export.kind != ExternalKind::Function {
				self.output.push_str(&format!("export {};\n", export.name));
				preamble = true;
			}
		}
		if preamble {
			self.output.push('\n');
		}
		self.image = Some(self.disasm.create_data_image()?);
		Ok(())
	}

	fn decompile_function(&mut self, function: &Function) -> Result<(), DecompileError> {
		let _span = debug_span!("function", index = function.index, name = %function.name).entered();

		let body = match &function.body {
			None => {
				self.push_line(&format!("{};", Self::signature(function)));
				self.output.push('\n');
				return Ok(());
			}
			Some(body) => body.clone(),
		};

		let mut header = format!("{:08X}\t{}", self.pc, Self::signature(function));
		if let Some(exported) = &function.exported_name {
			header.push_str(&format!(" export {}", exported));
		}
		self.push_line(&header);
		self.push_line("{");
		for local in function.locals.iter().filter(|local| !local.is_parameter) {
			self.push_line(&format!(
				"{} {};",
				Disassembler::type_name(local.value_type),
				local.name,
			));
		}
		self.push_line("");

		self.decompile_body(function, &body)?;

		self.push_line("}");
		self.output.push('\n');
		self.pc += body.len() as u64;
		Ok(())
	}

	fn build_output(&mut self) -> String {
		std::mem::take(&mut self.output)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::decompile::{decompile, DecompilerKind};
	use crate::parse::{Export, FuncType, FunctionBody, GlobalEntry, GlobalType, Module};
	use std::rc::Rc;

	fn disassembled(module: Module) -> Disassembler {
		let mut disassembler = Disassembler::new(module).unwrap();
		disassembler.disassemble_all().unwrap();
		disassembler
	}

	fn add_module() -> Module {
		Module {
			types: vec![Rc::new(FuncType {
				params: vec![ValueType::I32, ValueType::I32],
				has_return: true,
				return_type: ValueType::I32,
			})],
			function_types: vec![0],
			code: vec![FunctionBody {
				locals: Vec::new(),
				// get_local 0, get_local 1, i32.add, end
				code: vec![0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B],
			}],
			exports: vec![Export {
				name: "add".to_owned(),
				kind: ExternalKind::Function,
				index: 0,
			}],
			..Module::default()
		}
	}

	#[test]
	fn empty_module_renders_to_nothing() {
		let disassembler = disassembled(Module::default());
		assert_eq!(decompile(&disassembler, DecompilerKind::Flat).unwrap(), "");
	}

	#[test]
	fn exported_add_listing() {
		let disassembler = disassembled(add_module());
		let output = decompile(&disassembler, DecompilerKind::Flat).unwrap();

		assert!(output.contains("00000000\tint fun_00000000(int par0, int par1) export add"));
		assert!(output.contains("00000000\tgetlocal par0"));
		assert!(output.contains("00000002\tgetlocal par1"));
		assert!(output.contains("00000004\ti32_add"));
		// The final `end` byte is suppressed.
		assert!(!output.contains("\tend"));
	}

	#[test]
	fn global_and_load_listing() {
		let module = Module {
			types: vec![Rc::new(FuncType {
				params: Vec::new(),
				has_return: true,
				return_type: ValueType::I32,
			})],
			function_types: vec![0],
			globals: vec![GlobalEntry {
				global_type: GlobalType { content_type: ValueType::I32, mutability: true },
				init: vec![0x41, 0x80, 0x08, 0x0B], // i32.const 1024
			}],
			code: vec![FunctionBody {
				locals: Vec::new(),
				// get_global 0, i32.load align=2 offset=0, end
				code: vec![0x23, 0x00, 0x28, 0x02, 0x00, 0x0B],
			}],
			..Module::default()
		};
		let disassembler = disassembled(module);
		let output = decompile(&disassembler, DecompilerKind::Flat).unwrap();

		assert!(output.starts_with("static global_0 = 1024;\n"));
		assert!(output.contains("getglobal global_0"));
		assert!(output.contains("i32_load 00000000h [align=2]"));
	}

	#[test]
	fn load_inside_a_data_range_carries_string_info() {
		let module = Module {
			types: vec![Rc::new(FuncType::default())],
			function_types: vec![0],
			code: vec![FunctionBody {
				locals: Vec::new(),
				// i32.const 0, i32.load align=0 offset=8, drop, end
				code: vec![0x41, 0x00, 0x28, 0x00, 0x08, 0x1A, 0x0B],
			}],
			data: vec![crate::parse::DataSegment {
				memory_index: 0,
				offset_expr: vec![0x41, 0x08, 0x0B], // i32.const 8
				payload: b"hello\0".to_vec(),
			}],
			..Module::default()
		};
		let disassembler = disassembled(module);
		let output = decompile(&disassembler, DecompilerKind::Flat).unwrap();
		assert!(output.contains("i32_load 00000008h [align=0] ; hello"));
	}

	#[test]
	fn program_counter_increases_across_functions() {
		let mut module = add_module();
		module.function_types.push(0);
		module.code.push(FunctionBody {
			locals: Vec::new(),
			code: vec![0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B],
		});
		let disassembler = disassembled(module);
		let output = decompile(&disassembler, DecompilerKind::Flat).unwrap();

		// Second function starts where the first body (6 bytes) ended.
		assert!(output.contains("00000006\tint fun_00000001(int par0, int par1)"));
		assert!(output.contains("00000006\tgetlocal par0"));

		let mut last_pc = 0;
		for line in output.lines() {
			if let Some(hex) = line.split('\t').next().filter(|prefix| prefix.len() == 8) {
				if let Ok(pc) = u64::from_str_radix(hex, 16) {
					assert!(pc >= last_pc, "PC went backwards in line {:?}", line);
					last_pc = pc;
				}
			}
		}
	}

	#[test]
	fn import_renders_as_extern_declaration() {
		let module = Module {
			types: vec![Rc::new(FuncType::default())],
			imports: vec![crate::parse::Import {
				module: "env".to_owned(),
				field: "out".to_owned(),
				detail: crate::parse::ImportDetail::Function { type_index: 0 },
			}],
			..Module::default()
		};
		let disassembler = disassembled(module);
		let output = decompile(&disassembler, DecompilerKind::Flat).unwrap();
		assert!(output.contains("void $imp_env.out();"));
	}

	#[test]
	fn block_emits_anchor_label() {
		let module = Module {
			types: vec![Rc::new(FuncType::default())],
			function_types: vec![0],
			code: vec![FunctionBody {
				locals: Vec::new(),
				// block (empty), end, end
				code: vec![0x02, 0x40, 0x0B, 0x0B],
			}],
			..Module::default()
		};
		let disassembler = disassembled(module);
		let output = decompile(&disassembler, DecompilerKind::Flat).unwrap();
		assert!(output.contains("label_00000000:\tblock\n"));
	}

	#[test]
	fn reserved_opcode_is_rejected() {
		let module = Module {
			types: vec![Rc::new(FuncType::default())],
			function_types: vec![0],
			code: vec![FunctionBody { locals: Vec::new(), code: vec![0x06, 0x0B] }],
			..Module::default()
		};
		let disassembler = disassembled(module);
		assert!(matches!(
			decompile(&disassembler, DecompilerKind::Flat),
			Err(DecompileError::InvalidOpcode(_)),
		));
	}

	#[test]
	fn calls_record_cross_references() {
		let mut module = add_module();
		module.types.push(Rc::new(FuncType::default()));
		module.function_types.push(1);
		module.code.push(FunctionBody {
			locals: Vec::new(),
			code: vec![0x41, 0x01, 0x41, 0x02, 0x10, 0x00, 0x1A, 0x0B], // call 0, drop
		});
		let disassembler = disassembled(module);

		let mut decompiler = FlatDecompiler::new(&disassembler);
		decompiler.prepare().unwrap();
		for function in disassembler.functions() {
			decompiler.decompile_function(function).unwrap();
		}
		let output = decompiler.build_output();
		assert!(output.contains("call fun_00000000"));

		let from_caller = decompiler.xrefs().refs_for(1);
		assert_eq!(from_caller.len(), 1);
		assert_eq!(from_caller[0].target, 0);
		assert!(!from_caller[0].down);
		assert!(!from_caller[0].is_destination);
		let at_callee = decompiler.xrefs().refs_for(0);
		assert_eq!(at_callee.len(), 1);
		assert!(at_callee[0].is_destination);
	}
}

use std::rc::Rc;
use tracing::{debug, trace};
use crate::disasm::data::DataImage;
use crate::disasm::error::DisassemblyError;
use crate::disasm::types::*;
use crate::parse::{ByteReader, ExternalKind, FuncType, ImportDetail, Module, ValueType};

/// Lowers a parsed [Module] into named, typed entities: functions (imports
/// prepended), globals with decoded initializers, the collapsed table image
/// and the merged data image.
pub struct Disassembler {
	module: Module,
	types: Vec<Rc<FuncType>>,
	functions: Vec<Function>,
	globals: Vec<Global>,
	table: Vec<u32>,
	real_function_offset: u32,
}

impl Disassembler {
	pub fn new(module: Module) -> Result<Self, DisassemblyError> {
		let types = module.types.clone();
		let globals = decode_globals(&module)?;
		let table = match &module.elements {
			None => Vec::new(),
			Some(segments) => segments
				.first()
				.ok_or(DisassemblyError::EmptyElementSection)?
				.elems
				.clone(),
		};
		let real_function_offset = module
			.imports
			.iter()
			.filter(|import| matches!(import.detail, ImportDetail::Function { .. }))
			.count() as u32;

		let mut disassembler = Disassembler {
			module,
			types,
			functions: Vec::new(),
			globals,
			table,
			real_function_offset,
		};
		disassembler.functions = disassembler.import_functions()?;
		Ok(disassembler)
	}

	/// Count of imported functions; the boundary between import indices and
	/// code-section indices.
	pub fn real_function_offset(&self) -> u32 {
		self.real_function_offset
	}

	pub fn functions(&self) -> &[Function] {
		&self.functions
	}

	pub fn function(&self, index: FunctionId) -> Result<&Function, DisassemblyError> {
		self.functions
			.get(index as usize)
			.ok_or(DisassemblyError::FunctionIndexOutOfRange {
				index: index as usize,
				len: self.functions.len(),
			})
	}

	pub fn globals(&self) -> &[Global] {
		&self.globals
	}

	pub fn types(&self) -> &[Rc<FuncType>] {
		&self.types
	}

	pub fn func_type(&self, index: u32) -> Result<&Rc<FuncType>, DisassemblyError> {
		self.types
			.get(index as usize)
			.ok_or(DisassemblyError::TypeIndexOutOfRange {
				index: index as usize,
				len: self.types.len(),
			})
	}

	/// The element entries of the (single honored) first element segment.
	pub fn table(&self) -> &[u32] {
		&self.table
	}

	pub fn exports(&self) -> &[crate::parse::Export] {
		&self.module.exports
	}

	fn import_functions(&self) -> Result<Vec<Function>, DisassemblyError> {
		let mut functions = Vec::new();
		for import in &self.module.imports {
			let type_index = match import.detail {
				ImportDetail::Function { type_index } => type_index,
				_ => continue,
			};
			let func_type = self.func_type(type_index)?;
			functions.push(Function {
				name: format!("$imp_{}.{}", import.module, import.field),
				return_type: func_type.effective_return_type(),
				index: functions.len() as u32,
				locals: parameter_locals(func_type),
				body: None,
				exported_name: None,
			});
		}
		Ok(functions)
	}

	/// Rebuilds the lifted function list: imports first, then one function
	/// per code-section entry at index `real_function_offset + n`.
	pub fn disassemble_all(&mut self) -> Result<(), DisassemblyError> {
		self.functions = self.import_functions()?;
		trace!("disassembling {} code entries", self.module.code.len());

		for n in 0..self.module.code.len() {
			let index = self.real_function_offset + n as u32;
			let type_index = *self.module.function_types.get(n).ok_or(
				DisassemblyError::TypeIndexOutOfRange {
					index: n,
					len: self.module.function_types.len(),
				},
			)?;
			let func_type = self.func_type(type_index)?.clone();

			let body = &self.module.code[n];
			let mut locals = parameter_locals(&func_type);
			let mut counter = 0;
			for (count, local_type) in &body.locals {
				for _ in 0..*count {
					locals.push(Local {
						name: format!("local{}", counter),
						value_type: *local_type,
						is_parameter: false,
					});
					counter += 1;
				}
			}

			let exported_name = self
				.module
				.exports
				.iter()
				.find(|export| export.kind == ExternalKind::Function && export.index == index)
				.map(|export| export.name.clone());

			let function = Function {
				name: format!("fun_{:08X}", index),
				return_type: func_type.effective_return_type(),
				index,
				locals,
				body: Some(body.code.clone()),
				exported_name,
			};
			debug!("lifted {} ({} locals)", function.name, function.locals.len());
			self.functions.push(function);
		}
		Ok(())
	}

	/// Merges all data segments into one dense image, zero-filling the gaps.
	/// Ownership of the image passes to the caller.
	pub fn create_data_image(&self) -> Result<DataImage, DisassemblyError> {
		let mut image = Vec::new();
		let mut ranges = Vec::new();
		for segment in &self.module.data {
			let mut expr = ByteReader::new(segment.offset_expr.clone());
			// The offset expression is `i32.const <offset> end`.
			expr.read_u8()?;
			let start = expr.read_uleb128()?;
			let end = start as usize + segment.payload.len();
			if image.len() < end {
				image.resize(end, 0);
			}
			image[start as usize..end].copy_from_slice(&segment.payload);
			ranges.push(AddressRange { start, end: end as u32 });
		}
		trace!("data image of {} bytes from {} segments", image.len(), ranges.len());
		Ok(DataImage::new(image, ranges))
	}

	/// Describes the call edge `caller -> callee` for both endpoints. A
	/// callee index outside the function list is fatal.
	pub fn find_refs_from_call_fn(
		&self,
		caller: FunctionId,
		callee: FunctionId,
		offset: u32,
	) -> Result<TwoWayCrossReference, DisassemblyError> {
		if callee as usize >= self.functions.len() {
			return Err(DisassemblyError::FunctionIndexOutOfRange {
				index: callee as usize,
				len: self.functions.len(),
			});
		}
		let down = callee > caller;
		Ok(TwoWayCrossReference {
			from: caller,
			to: callee,
			source: CrossReference { down, is_destination: false, offset, target: callee },
			destination: CrossReference { down, is_destination: true, offset, target: caller },
		})
	}

	pub fn type_name(value_type: ValueType) -> &'static str {
		match value_type {
			ValueType::I32 => "int",
			ValueType::I64 => "long long",
			ValueType::F32 => "float",
			ValueType::F64 => "double",
			_ => "void",
		}
	}
}

fn parameter_locals(func_type: &FuncType) -> Vec<Local> {
	func_type
		.params
		.iter()
		.enumerate()
		.map(|(i, param_type)| Local {
			name: format!("par{}", i),
			value_type: *param_type,
			is_parameter: true,
		})
		.collect()
}

fn decode_globals(module: &Module) -> Result<Vec<Global>, DisassemblyError> {
	let mut globals = Vec::with_capacity(module.globals.len());
	for (index, entry) in module.globals.iter().enumerate() {
		let mut reader = ByteReader::new(entry.init.clone());
		// Skip the `<type>.const` opcode; the immediate follows.
		reader.read_u8()?;
		let content_type = entry.global_type.content_type;
		let value = match content_type {
			ValueType::I32 => reader.read_uleb128()?.to_string(),
			ValueType::I64 => reader.read_uleb128_64()?.to_string(),
			ValueType::F32 => (reader.read_i32()? as u32).to_string(),
			ValueType::F64 => (reader.read_i64()? as u64).to_string(),
			_ => return Err(DisassemblyError::UnsupportedGlobalType { index, content_type }),
		};
		globals.push(Global {
			name: format!("global_{}", index),
			value,
			type_name: Disassembler::type_name(content_type),
			is_const: !entry.global_type.mutability,
		});
	}
	Ok(globals)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::parse::{Export, FunctionBody, GlobalEntry, GlobalType, Import, ElementSegment};

	fn i32_type() -> Rc<FuncType> {
		Rc::new(FuncType {
			params: vec![ValueType::I32, ValueType::I32],
			has_return: true,
			return_type: ValueType::I32,
		})
	}

	fn module_with_import_and_function() -> Module {
		Module {
			types: vec![i32_type()],
			imports: vec![Import {
				module: "env".to_owned(),
				field: "out".to_owned(),
				detail: ImportDetail::Function { type_index: 0 },
			}],
			function_types: vec![0],
			code: vec![FunctionBody {
				locals: vec![(2, ValueType::I64)],
				code: vec![0x0B],
			}],
			exports: vec![Export {
				name: "add".to_owned(),
				kind: ExternalKind::Function,
				index: 1,
			}],
			..Module::default()
		}
	}

	#[test]
	fn function_index_space_counts_imports_first() {
		let mut disassembler = Disassembler::new(module_with_import_and_function()).unwrap();
		disassembler.disassemble_all().unwrap();

		assert_eq!(disassembler.real_function_offset(), 1);
		assert_eq!(disassembler.functions().len(), 2);

		let import = &disassembler.functions()[0];
		assert_eq!(import.name, "$imp_env.out");
		assert_eq!(import.index, 0);
		assert!(import.body.is_none());

		let function = &disassembler.functions()[1];
		assert_eq!(function.name, "fun_00000001");
		assert_eq!(function.index, 1);
		assert_eq!(function.exported_name.as_deref(), Some("add"));
	}

	#[test]
	fn locals_flatten_across_groups_after_parameters() {
		let mut disassembler = Disassembler::new(module_with_import_and_function()).unwrap();
		disassembler.disassemble_all().unwrap();

		let function = &disassembler.functions()[1];
		let names: Vec<&str> = function.locals.iter().map(|local| local.name.as_str()).collect();
		assert_eq!(names, ["par0", "par1", "local0", "local1"]);
		assert_eq!(function.parameters().count(), 2);
		assert_eq!(function.locals[2].value_type, ValueType::I64);
	}

	#[test]
	fn disassemble_all_is_idempotent() {
		let mut disassembler = Disassembler::new(module_with_import_and_function()).unwrap();
		disassembler.disassemble_all().unwrap();
		disassembler.disassemble_all().unwrap();
		assert_eq!(disassembler.functions().len(), 2);
	}

	#[test]
	fn global_initializers_decode_per_type() {
		let module = Module {
			globals: vec![
				GlobalEntry {
					global_type: GlobalType { content_type: ValueType::I32, mutability: true },
					init: vec![0x41, 0x80, 0x08, 0x0B], // i32.const 1024
				},
				GlobalEntry {
					global_type: GlobalType { content_type: ValueType::F32, mutability: false },
					init: {
						let mut init = vec![0x43];
						init.extend_from_slice(&1.5f32.to_le_bytes());
						init.push(0x0B);
						init
					},
				},
			],
			..Module::default()
		};
		let disassembler = Disassembler::new(module).unwrap();

		let first = &disassembler.globals()[0];
		assert_eq!(first.name, "global_0");
		assert_eq!(first.value, "1024");
		assert_eq!(first.type_name, "int");
		assert!(!first.is_const);

		let second = &disassembler.globals()[1];
		assert_eq!(second.value, (1.5f32.to_bits()).to_string());
		assert!(second.is_const);
	}

	#[test]
	fn data_image_reproduces_segment_payloads() {
		let module = Module {
			data: vec![
				crate::parse::DataSegment {
					memory_index: 0,
					offset_expr: vec![0x41, 0x04, 0x0B], // i32.const 4
					payload: b"hello\0".to_vec(),
				},
				crate::parse::DataSegment {
					memory_index: 0,
					offset_expr: vec![0x41, 0x20, 0x0B], // i32.const 32
					payload: vec![0xDE, 0xAD],
				},
			],
			..Module::default()
		};
		let disassembler = Disassembler::new(module).unwrap();
		let mut image = disassembler.create_data_image().unwrap();

		let ranges = image.ranges().to_vec();
		assert_eq!(ranges[0], AddressRange { start: 4, end: 10 });
		assert_eq!(ranges[1], AddressRange { start: 32, end: 34 });
		assert_eq!(image.len(), 34);

		assert_eq!(image.read_at(ranges[0]).unwrap(), b"hello\0");
		assert_eq!(image.read_at(ranges[1]).unwrap(), vec![0xDE, 0xAD]);
	}

	#[test]
	fn empty_element_section_is_rejected() {
		let module = Module { elements: Some(Vec::new()), ..Module::default() };
		assert!(matches!(
			Disassembler::new(module),
			Err(DisassemblyError::EmptyElementSection),
		));
	}

	#[test]
	fn first_element_segment_becomes_the_table() {
		let module = Module {
			elements: Some(vec![
				ElementSegment { table_index: 0, offset_expr: vec![0x41, 0x00, 0x0B], elems: vec![3, 1, 2] },
				ElementSegment { table_index: 0, offset_expr: vec![0x41, 0x08, 0x0B], elems: vec![9] },
			]),
			..Module::default()
		};
		let disassembler = Disassembler::new(module).unwrap();
		assert_eq!(disassembler.table(), &[3, 1, 2]);
	}

	#[test]
	fn call_references_know_their_direction() {
		let mut disassembler = Disassembler::new(module_with_import_and_function()).unwrap();
		disassembler.disassemble_all().unwrap();

		let down = disassembler.find_refs_from_call_fn(0, 1, 8).unwrap();
		assert!(down.source.down);
		assert!(!down.source.is_destination);
		assert_eq!(down.source.target, 1);
		assert_eq!(down.destination.target, 0);

		let up = disassembler.find_refs_from_call_fn(1, 0, 2).unwrap();
		assert!(!up.source.down);

		assert!(matches!(
			disassembler.find_refs_from_call_fn(0, 7, 0),
			Err(DisassemblyError::FunctionIndexOutOfRange { index: 7, len: 2 }),
		));
	}
}

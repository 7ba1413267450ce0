use std::rc::Rc;
use tracing::{debug, trace};
use crate::parse::{
	error::*,
	reader::*,
	types::*,
};

const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];
const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// End marker of init expressions and function bodies.
const OPCODE_END: u8 = 0x0B;

pub struct Parser {
	reader: ByteReader,
	module: Module,
}

impl Parser {
	pub fn parse_module(bytecode: Vec<u8>) -> Result<Module, ParsingError> {
		let parser = Parser {
			reader: ByteReader::new(bytecode),
			module: Module::default(),
		};
		parser.parse_module_internal()
	}

	/// Value types travel as LEB128 on the wire.
	fn read_value_type(&mut self) -> Result<ValueType, ParsingError> {
		let byte = self.reader.read_uleb128()?;
		Ok(ValueType::try_from(byte as u8)?)
	}

	/// Length-prefixed name, interpreted as UTF-8 without validation.
	fn read_string(&mut self) -> Result<String, ParsingError> {
		let length = self.reader.read_uleb128()? as usize;
		let bytes = self.reader.read_bytes(length)?;
		Ok(String::from_utf8_lossy(&bytes).into_owned())
	}

	/// Captures raw init expression bytes up to and including the `end` marker.
	fn read_init_expr(&mut self) -> Result<Vec<u8>, ParsingError> {
		let mut expr = Vec::new();
		loop {
			let byte = self.reader.read_u8()?;
			expr.push(byte);
			if byte == OPCODE_END {
				return Ok(expr);
			}
		}
	}

	fn read_limits(&mut self) -> Result<ResizableLimits, ParsingError> {
		let has_max = self.reader.read_uleb128()? == 1;
		let initial = self.reader.read_uleb128()?;
		let maximum = match has_max {
			true => self.reader.read_uleb128()?,
			false => 0,
		};
		Ok(ResizableLimits { has_max, initial, maximum })
	}

	fn read_global_type(&mut self) -> Result<GlobalType, ParsingError> {
		let content_type = self.read_value_type()?;
		let mutability = self.reader.read_uleb128()? == 1;
		Ok(GlobalType { content_type, mutability })
	}

	fn parse_func_type(&mut self) -> Result<FuncType, ParsingError> {
		// The form byte (`func`) opens every entry.
		let _form = self.read_value_type()?;

		let num_params = self.reader.read_uleb128()? as usize;
		let mut params = Vec::with_capacity(num_params);
		for _ in 0..num_params {
			params.push(self.read_value_type()?);
		}

		let has_return = self.reader.read_uleb128()? == 1;
		let return_type = match has_return {
			true => self.read_value_type()?,
			false => ValueType::Void,
		};

		Ok(FuncType { params, has_return, return_type })
	}

	fn parse_type_section(&mut self) -> Result<(), ParsingError> {
		let num_types = self.reader.read_uleb128()? as usize;
		trace!("parsing type section with {} types", num_types);
		for _ in 0..num_types {
			let func_type = self.parse_func_type()?;
			debug!("{:?}", func_type);
			self.module.types.push(Rc::new(func_type));
		}
		Ok(())
	}

	fn parse_import_section(&mut self) -> Result<(), ParsingError> {
		let num_imports = self.reader.read_uleb128()? as usize;
		trace!("parsing import section with {} imports", num_imports);
		for _ in 0..num_imports {
			let module = self.read_string()?;
			let field = self.read_string()?;
			let kind_byte = self.reader.read_u8()?;
			let kind = ExternalKind::try_from(kind_byte)
				.map_err(|_| ParsingError::InvalidImportKind(kind_byte))?;
			let detail = match kind {
				ExternalKind::Function => ImportDetail::Function {
					type_index: self.reader.read_uleb128()?,
				},
				ExternalKind::Table => ImportDetail::Table(TableType {
					element_type: self.read_value_type()?,
					limits: self.read_limits()?,
				}),
				ExternalKind::Memory => ImportDetail::Memory(self.read_limits()?),
				ExternalKind::Global => ImportDetail::Global(self.read_global_type()?),
			};
			let import = Import { module, field, detail };
			debug!("{:?}", import);
			self.module.imports.push(import);
		}
		Ok(())
	}

	fn parse_function_section(&mut self) -> Result<(), ParsingError> {
		let num_functions = self.reader.read_uleb128()? as usize;
		trace!("parsing function section with {} functions", num_functions);
		for _ in 0..num_functions {
			self.module.function_types.push(self.reader.read_uleb128()?);
		}
		Ok(())
	}

	fn parse_table_section(&mut self) -> Result<(), ParsingError> {
		let num_tables = self.reader.read_uleb128()? as usize;
		trace!("parsing table section with {} tables", num_tables);
		for _ in 0..num_tables {
			let element_type = self.read_value_type()?;
			let limits = self.read_limits()?;
			self.module.tables.push(TableType { element_type, limits });
		}
		Ok(())
	}

	fn parse_memory_section(&mut self) -> Result<(), ParsingError> {
		let num_memories = self.reader.read_uleb128()? as usize;
		trace!("parsing memory section with {} memories", num_memories);
		for _ in 0..num_memories {
			let limits = self.read_limits()?;
			self.module.memories.push(limits);
		}
		Ok(())
	}

	fn parse_global_section(&mut self) -> Result<(), ParsingError> {
		let num_globals = self.reader.read_uleb128()? as usize;
		trace!("parsing global section with {} globals", num_globals);
		for _ in 0..num_globals {
			let global_type = self.read_global_type()?;
			let init = self.read_init_expr()?;
			self.module.globals.push(GlobalEntry { global_type, init });
		}
		Ok(())
	}

	fn parse_export_section(&mut self) -> Result<(), ParsingError> {
		let num_exports = self.reader.read_uleb128()? as usize;
		trace!("parsing export section with {} exports", num_exports);
		for _ in 0..num_exports {
			let name = self.read_string()?;
			let kind_byte = self.reader.read_u8()?;
			let kind = ExternalKind::try_from(kind_byte)
				.map_err(|_| ParsingError::InvalidExportKind(kind_byte))?;
			let index = self.reader.read_uleb128()?;
			let export = Export { name, kind, index };
			debug!("{:?}", export);
			self.module.exports.push(export);
		}
		Ok(())
	}

	fn parse_element_section(&mut self) -> Result<(), ParsingError> {
		let num_segments = self.reader.read_uleb128()? as usize;
		trace!("parsing element section with {} segments", num_segments);
		let mut segments = Vec::with_capacity(num_segments);
		for _ in 0..num_segments {
			let table_index = self.reader.read_uleb128()?;
			let offset_expr = self.read_init_expr()?;
			let num_elems = self.reader.read_uleb128()? as usize;
			let mut elems = Vec::with_capacity(num_elems);
			for _ in 0..num_elems {
				elems.push(self.reader.read_uleb128()?);
			}
			segments.push(ElementSegment { table_index, offset_expr, elems });
		}
		self.module.elements = Some(segments);
		Ok(())
	}

	fn parse_function_body(&mut self) -> Result<FunctionBody, ParsingError> {
		// Whatever of `body_size` the local groups do not consume is bytecode.
		let body_size = self.reader.read_uleb128()? as usize;
		let body_start = self.reader.pos();

		let num_groups = self.reader.read_uleb128()? as usize;
		let mut locals = Vec::with_capacity(num_groups);
		for _ in 0..num_groups {
			let count = self.reader.read_uleb128()?;
			let local_type = self.read_value_type()?;
			locals.push((count, local_type));
		}

		let locals_size = self.reader.pos() - body_start;
		let code_size = body_size
			.checked_sub(locals_size)
			.ok_or(ParsingError::UnexpectedEndOfStream)?;
		let code = self.reader.read_bytes(code_size)?;
		Ok(FunctionBody { locals, code })
	}

	fn parse_code_section(&mut self) -> Result<(), ParsingError> {
		let num_bodies = self.reader.read_uleb128()? as usize;
		trace!("parsing code section with {} bodies", num_bodies);
		for _ in 0..num_bodies {
			let body = self.parse_function_body()?;
			self.module.code.push(body);
		}
		Ok(())
	}

	fn parse_data_section(&mut self) -> Result<(), ParsingError> {
		let num_segments = self.reader.read_uleb128()? as usize;
		trace!("parsing data section with {} segments", num_segments);
		for _ in 0..num_segments {
			let memory_index = self.reader.read_uleb128()?;
			let offset_expr = self.read_init_expr()?;
			let size = self.reader.read_uleb128()? as usize;
			let payload = self.reader.read_bytes(size)?;
			self.module.data.push(DataSegment { memory_index, offset_expr, payload });
		}
		Ok(())
	}

	fn parse_module_internal(mut self) -> Result<Module, ParsingError> {
		if self.reader.read_bytes(4)? != WASM_MAGIC {
			return Err(ParsingError::InvalidModule);
		}
		if self.reader.read_bytes(4)? != WASM_VERSION {
			return Err(ParsingError::InvalidModule);
		}

		while self.reader.pos() < self.reader.len() {
			let id = self.reader.read_uleb128()?;
			let payload_size = self.reader.read_uleb128()?;
			let section_id = u8::try_from(id)
				.ok()
				.and_then(|id| SectionId::try_from(id).ok())
				.ok_or(ParsingError::InvalidSectionId(id))?;
			trace!("section {:?} with {} payload bytes", section_id, payload_size);
			match section_id {
				SectionId::Custom => {
					// Payload (including the name) is of no interest here.
					self.reader.seek(payload_size as i64, SeekOrigin::Current)?;
				}
				SectionId::Type => self.parse_type_section()?,
				SectionId::Import => self.parse_import_section()?,
				SectionId::Function => self.parse_function_section()?,
				SectionId::Table => self.parse_table_section()?,
				SectionId::Memory => self.parse_memory_section()?,
				SectionId::Global => self.parse_global_section()?,
				SectionId::Export => self.parse_export_section()?,
				SectionId::Start => self.module.start = Some(self.reader.read_uleb128()?),
				SectionId::Element => self.parse_element_section()?,
				SectionId::Code => self.parse_code_section()?,
				SectionId::Data => self.parse_data_section()?,
			}
		}
		Ok(self.module)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Wraps `sections` in the module preamble.
	fn module_bytes(sections: &[&[u8]]) -> Vec<u8> {
		let mut bytes = Vec::new();
		bytes.extend_from_slice(&WASM_MAGIC);
		bytes.extend_from_slice(&WASM_VERSION);
		for section in sections {
			bytes.extend_from_slice(section);
		}
		bytes
	}

	#[test]
	fn empty_module() {
		let module = Module::new(module_bytes(&[])).unwrap();
		assert!(module.types.is_empty());
		assert!(module.code.is_empty());
		assert!(module.globals.is_empty());
		assert!(module.elements.is_none());
	}

	#[test]
	fn magic_flip_is_invalid_module() {
		for position in 0..8 {
			let mut bytes = module_bytes(&[]);
			bytes[position] ^= 0x01;
			assert!(
				matches!(Module::new(bytes), Err(ParsingError::InvalidModule)),
				"flip at byte {} must be rejected",
				position,
			);
		}
	}

	#[test]
	fn type_section() {
		let module = Module::new(module_bytes(&[&[
			0x01, 0x07, // section id, payload size
			0x01, // num types
			0x60, // func
			0x02, // num params
			0x7F, // i32
			0x7F, // i32
			0x01, // num results
			0x7F, // i32
		]]))
		.unwrap();
		assert_eq!(
			*module.types[0],
			FuncType {
				params: vec![ValueType::I32, ValueType::I32],
				has_return: true,
				return_type: ValueType::I32,
			},
		);
	}

	#[test]
	fn export_section() {
		let module = Module::new(module_bytes(&[&[
			0x07, 0x07, // section id, payload size
			0x01, // num exports
			0x03, // name length
			0x61, 0x64, 0x64, // "add"
			0x00, // export kind: function
			0x00, // function index
		]]))
		.unwrap();
		assert_eq!(module.exports[0].name, "add");
		assert_eq!(module.exports[0].kind, ExternalKind::Function);
		assert_eq!(module.exports[0].index, 0);
	}

	#[test]
	fn import_section() {
		let module = Module::new(module_bytes(&[
			&[
				0x01, 0x04, // type section
				0x01, // num types
				0x60, // func
				0x00, // num params
				0x00, // num results
			],
			&[
				0x02, 0x0B, // import section
				0x01, // num imports
				0x03, // module name length
				0x65, 0x6E, 0x76, // "env"
				0x04, // field name length
				0x65, 0x78, 0x69, 0x74, // "exit"
				0x00, // import kind: function
				0x00, // type index
			],
		]))
		.unwrap();
		let import = &module.imports[0];
		assert_eq!(import.module, "env");
		assert_eq!(import.field, "exit");
		assert_eq!(import.detail, ImportDetail::Function { type_index: 0 });
	}

	#[test]
	fn unknown_import_kind() {
		let result = Module::new(module_bytes(&[&[
			0x02, 0x06, // import section
			0x01, // num imports
			0x01, 0x61, // module "a"
			0x01, 0x62, // field "b"
			0x07, // bogus kind
			0x00,
		]]));
		assert!(matches!(result, Err(ParsingError::InvalidImportKind(0x07))));
	}

	#[test]
	fn global_section_keeps_raw_init() {
		let module = Module::new(module_bytes(&[&[
			0x06, 0x07, // section id, payload size
			0x01, // num globals
			0x7F, // i32
			0x01, // mutable
			0x41, 0x80, 0x08, // i32.const 1024
			0x0B, // end
		]]))
		.unwrap();
		let global = &module.globals[0];
		assert_eq!(global.global_type.content_type, ValueType::I32);
		assert!(global.global_type.mutability);
		assert_eq!(global.init, vec![0x41, 0x80, 0x08, 0x0B]);
	}

	#[test]
	fn code_section_splits_locals_from_bytecode() {
		let module = Module::new(module_bytes(&[
			&[
				0x01, 0x04, // type section
				0x01, 0x60, 0x00, 0x00, // one () -> () type
			],
			&[
				0x03, 0x02, // function section
				0x01, 0x00, // one function of type 0
			],
			&[
				0x0A, 0x07, // code section
				0x01, // num bodies
				0x05, // body size
				0x01, // one local group
				0x02, 0x7E, // 2 × i64
				0x01, 0x0B, // nop, end
			],
		]))
		.unwrap();
		let body = &module.code[0];
		assert_eq!(body.locals, vec![(2, ValueType::I64)]);
		assert_eq!(body.code, vec![0x01, 0x0B]);
	}

	#[test]
	fn unknown_section_id() {
		let result = Module::new(module_bytes(&[&[0x0C, 0x01, 0x00]]));
		assert!(matches!(result, Err(ParsingError::InvalidSectionId(12))));
	}

	#[test]
	fn truncated_payload() {
		// Data section promising 4 payload bytes but delivering 1.
		let result = Module::new(module_bytes(&[&[
			0x0B, 0x08, // section id, payload size
			0x01, // num segments
			0x00, // memory index
			0x41, 0x00, 0x0B, // i32.const 0, end
			0x04, // segment size
			0xAA, // lone payload byte
		]]));
		assert!(matches!(result, Err(ParsingError::UnexpectedEndOfStream)));
	}

	#[test]
	fn start_section_records_index() {
		let module = Module::new(module_bytes(&[&[0x08, 0x01, 0x02]])).unwrap();
		assert_eq!(module.start, Some(2));
	}
}

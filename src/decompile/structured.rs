use tracing::{debug_span, trace};
use crate::decompile::expression::{Expression, Operand};
use crate::decompile::opcode::{Opcode, TruncSatOp};
use crate::decompile::{global_at, local_at, zero_value, DecompileError, Decompiler};
use crate::disasm::{Disassembler, Function};
use crate::parse::{ByteReader, ParsingError, ValueType};

/// C/JS-flavored pseudocode renderer. Runs a symbolic operand stack over the
/// bytecode, folding operations into expression trees and reconstructing
/// `block`/`loop`/`if` nesting from the branch opcodes.
pub struct StructuredDecompiler<'m> {
	disasm: &'m Disassembler,
	output: String,
}

/// Per-function decoder state, passed through the recursion explicitly.
struct DecodeState<'f> {
	function: &'f Function,
	stack: Vec<Operand>,
	branches: Vec<BranchFrame>,
	depth: usize,
	/// Instruction counter; mints branch labels.
	counter: u32,
	/// Set while decoding the arms of an `if`.
	inside_if: bool,
}

/// An open `block`, `loop` or `if` (plus the implicit function-level frame).
struct BranchFrame {
	label: String,
	block_type: ValueType,
	is_loop: bool,
}

/// What ended a recursive decode: the block's `end`, or the `else` separating
/// the arms of an `if`.
#[derive(Eq, PartialEq, Debug)]
enum Terminator {
	End,
	Else,
}

fn has_result(block_type: ValueType) -> bool {
	block_type != ValueType::EmptyBlock && block_type != ValueType::Void
}

impl DecodeState<'_> {
	fn pop(&mut self) -> Result<Operand, DecompileError> {
		self.stack.pop().ok_or(DecompileError::PopOnEmptyOperandStack)
	}

	/// Pops two values; the bottom of the pair becomes the left operand, so
	/// `push lhs; push rhs; op` folds into `lhs OP rhs`.
	fn pop_reverse2(&mut self) -> Result<(Operand, Operand), DecompileError> {
		let rhs = self.pop()?;
		let lhs = self.pop()?;
		Ok((lhs, rhs))
	}

	/// Pops until a value usable as `value_type` shows up, discarding stray
	/// entries above it. `Void` asks for no value at all.
	fn pop_match_type(&mut self, value_type: ValueType) -> Result<Operand, DecompileError> {
		if !has_result(value_type) {
			return Ok(Operand::Void);
		}
		loop {
			let operand = self.pop()?;
			if operand.matches_type(value_type) {
				return Ok(operand);
			}
		}
	}

	/// The non-destructive variant: finds the topmost usable value without
	/// disturbing the stack.
	fn peek_match_type(&self, value_type: ValueType) -> Result<Operand, DecompileError> {
		if !has_result(value_type) {
			return Ok(Operand::Void);
		}
		self.stack
			.iter()
			.rev()
			.find(|operand| operand.matches_type(value_type))
			.cloned()
			.ok_or(DecompileError::PopOnEmptyOperandStack)
	}
}

impl<'m> StructuredDecompiler<'m> {
	pub fn new(disasm: &'m Disassembler) -> Self {
		StructuredDecompiler { disasm, output: String::new() }
	}

	fn append_line(&mut self, text: &str, depth: usize) {
		for _ in 0..depth {
			self.output.push_str("    ");
		}
		self.output.push_str(text);
		self.output.push('\n');
	}

	/// `return;` or `return <value>;` depending on the block type.
	fn emit_return_shape(
		&mut self,
		state: &DecodeState,
		block_type: ValueType,
		depth: usize,
	) -> Result<(), DecompileError> {
		if !has_result(block_type) {
			self.append_line("return;", depth);
			return Ok(());
		}
		let value = state.peek_match_type(block_type)?;
		self.append_line(&format!("return {};", value), depth);
		Ok(())
	}

	/// Lowers `br <target>`: `continue;` towards a loop, a `return` shape
	/// everywhere else. With only the function-level frame open, the jump
	/// leaves the function.
	fn emit_branch(
		&mut self,
		state: &DecodeState,
		target: u32,
		depth: usize,
	) -> Result<(), DecompileError> {
		if state.branches.len() <= 1 {
			let block_type = state
				.branches
				.last()
				.map(|frame| frame.block_type)
				.unwrap_or(state.function.return_type);
			return self.emit_return_shape(state, block_type, depth);
		}
		let index = state
			.branches
			.len()
			.checked_sub(1 + target as usize)
			.ok_or(DecompileError::BranchDepthOutOfRange {
				depth: target,
				len: state.branches.len(),
			})?;
		let frame = &state.branches[index];
		trace!("branch {} levels up towards {}", target, frame.label);
		if frame.is_loop {
			self.append_line("continue;", depth);
			return Ok(());
		}
		let block_type = frame.block_type;
		self.emit_return_shape(state, block_type, depth)
	}

	/// `block t` lowers to a nested function: the body becomes
	/// `function __lambda_<label>() { ... }`, its result (if any) lands in a
	/// synthetic local that is pushed for both potential consumers.
	fn lower_block(
		&mut self,
		state: &mut DecodeState,
		reader: &mut ByteReader,
		block_type: ValueType,
	) -> Result<(), DecompileError> {
		let id = state.counter;
		let label = format!("block_{}", id);
		state.branches.push(BranchFrame {
			label: label.clone(),
			block_type,
			is_loop: false,
		});

		let outer = state.depth;
		self.append_line(&format!("function __lambda_{}() {{", label), outer);
		state.depth = outer + 1;
		let saved_inside_if = state.inside_if;
		state.inside_if = false;
		self.decode_block(state, reader)?;
		state.inside_if = saved_inside_if;
		state.depth = outer;
		self.append_line("}", outer);

		state.branches.pop();
		self.emit_lambda_result(state, &label, id, block_type);
		Ok(())
	}

	/// `loop t`: an endless loop broken on fall-through; `br` towards the
	/// frame becomes `continue`.
	fn lower_loop(
		&mut self,
		state: &mut DecodeState,
		reader: &mut ByteReader,
		block_type: ValueType,
	) -> Result<(), DecompileError> {
		let id = state.counter;
		let label = format!("loop_{}", id);
		state.branches.push(BranchFrame {
			label: label.clone(),
			block_type,
			is_loop: true,
		});

		let outer = state.depth;
		let body_depth = match has_result(block_type) {
			true => {
				self.append_line(&format!("function __lambda_{}() {{", label), outer);
				self.append_line("while (true) {", outer + 1);
				outer + 2
			}
			false => {
				self.append_line("while (true) {", outer);
				outer + 1
			}
		};
		state.depth = body_depth;
		let saved_inside_if = state.inside_if;
		state.inside_if = false;
		self.decode_block(state, reader)?;
		state.inside_if = saved_inside_if;
		state.depth = outer;
		self.append_line("break;", body_depth);
		self.append_line("}", body_depth - 1);
		if has_result(block_type) {
			self.append_line("}", outer);
		}

		state.branches.pop();
		if has_result(block_type) {
			self.emit_lambda_result(state, &label, id, block_type);
		}
		Ok(())
	}

	/// The call of a lowered `__lambda_`: a bare statement for void blocks,
	/// otherwise an assignment into a synthetic local pushed twice.
	fn emit_lambda_result(
		&mut self,
		state: &mut DecodeState,
		label: &str,
		id: u32,
		block_type: ValueType,
	) {
		let call = Expression::call(format!("__lambda_{}", label), Vec::new());
		if !has_result(block_type) {
			self.append_line(&format!("{};", call), state.depth);
			return;
		}
		let result = Operand::Local {
			name: format!("__dyn_local_{}", id),
			value_type: block_type,
		};
		let assignment = Expression::binary(result.clone(), "=", call);
		self.append_line(&format!("{};", assignment), state.depth);
		state.stack.push(result.clone());
		state.stack.push(result);
	}

	/// `if t`: the consequent runs to `else` or `end`; an `else` opens the
	/// alternative arm, which runs to its own `end`.
	fn lower_if(
		&mut self,
		state: &mut DecodeState,
		reader: &mut ByteReader,
		block_type: ValueType,
	) -> Result<(), DecompileError> {
		let id = state.counter;
		let condition = state.pop()?;
		state.branches.push(BranchFrame {
			label: format!("block_{}", id),
			block_type,
			is_loop: false,
		});

		let outer = state.depth;
		self.append_line(&format!("if ({}) {{", condition), outer);
		state.depth = outer + 1;
		let saved_inside_if = state.inside_if;
		state.inside_if = true;
		let terminator = self.decode_block(state, reader)?;
		if terminator == Terminator::Else {
			self.append_line("} else {", outer);
			state.inside_if = false;
			self.decode_block(state, reader)?;
		}
		state.inside_if = saved_inside_if;
		state.depth = outer;
		self.append_line("}", outer);

		state.branches.pop();
		Ok(())
	}

	/// Decodes opcodes until the terminating `end` (or `else`) of the
	/// current nesting level.
	fn decode_block(
		&mut self,
		state: &mut DecodeState,
		reader: &mut ByteReader,
	) -> Result<Terminator, DecompileError> {
		let disasm = self.disasm;
		loop {
			let opcode = Opcode::try_from(reader.read_u8()?)?;
			state.counter += 1;
			match opcode {
				Opcode::End => {
					let block_type = state
						.branches
						.last()
						.map(|frame| frame.block_type)
						.unwrap_or(state.function.return_type);
					if has_result(block_type) && !state.stack.is_empty() {
						let value = state.pop()?;
						self.append_line(&format!("return {};", value), state.depth);
					}
					return Ok(Terminator::End);
				}
				Opcode::Else => {
					if !state.inside_if {
						return Err(DecompileError::InvalidState("else outside of if"));
					}
					return Ok(Terminator::Else);
				}
				Opcode::Block => {
					let block_type = read_block_type(reader)?;
					self.lower_block(state, reader, block_type)?;
				}
				Opcode::Loop => {
					let block_type = read_block_type(reader)?;
					self.lower_loop(state, reader, block_type)?;
				}
				Opcode::If => {
					let block_type = read_block_type(reader)?;
					self.lower_if(state, reader, block_type)?;
				}
				Opcode::Br => {
					let target = reader.read_uleb128()?;
					self.emit_branch(state, target, state.depth)?;
				}
				Opcode::BrIf => {
					let target = reader.read_uleb128()?;
					let condition = state.pop()?;
					self.append_line(&format!("if ({})", condition), state.depth);
					self.emit_branch(state, target, state.depth + 1)?;
				}
				Opcode::BrTable => {
					let count = reader.read_uleb128()?;
					let mut targets = Vec::with_capacity(count as usize);
					for _ in 0..count {
						targets.push(reader.read_uleb128()?);
					}
					let default = reader.read_uleb128()?;
					let selector = state.pop()?;
					self.append_line(&format!("switch ({}) {{", selector), state.depth);
					for (case, target) in targets.iter().enumerate() {
						self.append_line(&format!("case {}:", case), state.depth + 1);
						self.emit_branch(state, *target, state.depth + 2)?;
					}
					self.append_line("default:", state.depth + 1);
					self.emit_branch(state, default, state.depth + 2)?;
					self.append_line("}", state.depth);
				}
				Opcode::Return => {
					let return_type = state.function.return_type;
					match state.pop_match_type(return_type)? {
						Operand::Void => self.append_line("return;", state.depth),
						value => self.append_line(&format!("return {};", value), state.depth),
					}
				}
				Opcode::Unreachable => {
					self.append_line("__unreachable();", state.depth);
				}
				Opcode::Nop => {}
				Opcode::Call => {
					let callee = disasm.function(reader.read_uleb128()?)?;
					let param_types: Vec<ValueType> =
						callee.parameters().map(|local| local.value_type).collect();
					let mut args = Vec::with_capacity(param_types.len());
					for param_type in param_types.iter().rev() {
						args.push(state.pop_match_type(*param_type)?);
					}
					args.reverse();
					let call = Expression::call(callee.name.clone(), args);
					match has_result(callee.return_type) {
						true => state.stack.push(call),
						false => self.append_line(&format!("{};", call), state.depth),
					}
				}
				Opcode::CallIndirect => {
					let func_type = disasm.func_type(reader.read_uleb128()?)?.clone();
					reader.read_u8()?; // reserved
					let selector = state.pop()?;
					let mut args = Vec::with_capacity(func_type.params.len());
					for param_type in func_type.params.iter().rev() {
						args.push(state.pop_match_type(*param_type)?);
					}
					args.reverse();
					let call = Expression::call(selector.to_string(), args);
					match func_type.has_return {
						true => state.stack.push(call),
						false => self.append_line(&format!("{};", call), state.depth),
					}
				}
				Opcode::Drop => {
					let value = state.pop()?;
					// A dropped call still has an observable side effect.
					if value.is_function_call() {
						self.append_line(&format!("{};", value), state.depth);
					}
				}
				Opcode::Select => {
					let condition = state.pop()?;
					let when_true = state.pop()?;
					let when_false = state.pop()?;
					state.stack.push(Expression::ternary(condition, when_true, when_false));
				}
				Opcode::GetLocal => {
					let local = local_at(state.function, reader.read_uleb128()? as usize)?;
					state.stack.push(Operand::Local {
						name: local.name.clone(),
						value_type: local.value_type,
					});
				}
				Opcode::SetLocal => {
					let local = local_at(state.function, reader.read_uleb128()? as usize)?;
					let name = local.name.clone();
					let value = state.pop()?;
					self.append_line(&format!("{} = {};", name, value), state.depth);
				}
				Opcode::TeeLocal => {
					let local = local_at(state.function, reader.read_uleb128()? as usize)?;
					let operand = Operand::Local {
						name: local.name.clone(),
						value_type: local.value_type,
					};
					let value = state.pop()?;
					self.append_line(&format!("{} = {};", local.name, value), state.depth);
					state.stack.push(operand);
				}
				Opcode::GetGlobal => {
					let global = global_at(disasm, reader.read_uleb128()? as usize)?;
					state.stack.push(Operand::Global { name: global.name.clone() });
				}
				Opcode::SetGlobal => {
					let global = global_at(disasm, reader.read_uleb128()? as usize)?;
					let name = global.name.clone();
					let value = state.pop()?;
					self.append_line(&format!("{} = {};", name, value), state.depth);
				}
				Opcode::CurrentMemory => {
					let reserved = reader.read_u8()?;
					state.stack.push(Expression::call(
						"__getmemsize",
						vec![Operand::I32(reserved as i32)],
					));
				}
				Opcode::GrowMemory => {
					let reserved = reader.read_u8()?;
					state.stack.push(Expression::call(
						"__growmemsize",
						vec![Operand::I32(reserved as i32)],
					));
				}
				Opcode::I32Const => state.stack.push(Operand::I32(reader.read_sleb128()?)),
				Opcode::I64Const => state.stack.push(Operand::I64(reader.read_sleb128_64()?)),
				Opcode::F32Const => state.stack.push(Operand::F32(reader.read_f32()?)),
				Opcode::F64Const => state.stack.push(Operand::F64(reader.read_f64()?)),
				Opcode::I32Eqz | Opcode::I64Eqz => {
					let value = state.pop()?;
					state.stack.push(Expression::binary(value, "==", Operand::I32(0)));
				}
				Opcode::F32Neg | Opcode::F64Neg => {
					let value = state.pop()?;
					state.stack.push(Expression::unary("-", value));
				}
				memory_access if is_load(memory_access) => {
					let align = reader.read_uleb128()?;
					let offset = reader.read_uleb128()?;
					let address = state.pop()?;
					state.stack.push(Expression::call(
						"mem_get_value",
						vec![address_expression(address, offset), Operand::I32(align as i32)],
					));
				}
				memory_access if is_store(memory_access) => {
					let align = reader.read_uleb128()?;
					let offset = reader.read_uleb128()?;
					let value = state.pop()?;
					let address = state.pop()?;
					let call = Expression::call(
						"mem_set_value",
						vec![
							address_expression(address, offset),
							value,
							Operand::I32(align as i32),
						],
					);
					self.append_line(&format!("{};", call), state.depth);
				}
				Opcode::TruncSatPrefix => {
					let selector = TruncSatOp::try_from(reader.read_u8()?)?;
					let value = state.pop()?;
					let name = match selector.result_is_64_bit() {
						true => "__trunc_sat64",
						false => "__trunc_sat32",
					};
					state.stack.push(Expression::call(name, vec![value]));
				}
				numeric => {
					if let Some(op) = binary_operator(numeric) {
						let (lhs, rhs) = state.pop_reverse2()?;
						state.stack.push(Expression::binary(lhs, op, rhs));
					} else if let Some((name, arity)) = call_wrapper(numeric) {
						let args = match arity {
							2 => {
								let (lhs, rhs) = state.pop_reverse2()?;
								vec![lhs, rhs]
							}
							_ => vec![state.pop()?],
						};
						state.stack.push(Expression::call(name, args));
					} else if let Some(target) = cast_target(numeric) {
						let value = state.pop()?;
						state.stack.push(Expression::unary(
							format!("({})", Disassembler::type_name(target)),
							value,
						));
					} else {
						return Err(DecompileError::InvalidState("unhandled opcode"));
					}
				}
			}
		}
	}
}

fn read_block_type(reader: &mut ByteReader) -> Result<ValueType, DecompileError> {
	let byte = reader.read_u8()?;
	Ok(ValueType::try_from(byte).map_err(ParsingError::from)?)
}

fn address_expression(address: Operand, offset: u32) -> Operand {
	match offset {
		0 => address,
		offset => Expression::binary(address, "+", Operand::I32(offset as i32)),
	}
}

fn is_load(opcode: Opcode) -> bool {
	(Opcode::I32Load as u8..=Opcode::I64Load32U as u8).contains(&(opcode as u8))
}

fn is_store(opcode: Opcode) -> bool {
	(Opcode::I32Store as u8..=Opcode::I64Store32 as u8).contains(&(opcode as u8))
}

fn binary_operator(opcode: Opcode) -> Option<&'static str> {
	use Opcode::*;
	Some(match opcode {
		I32Eq | I64Eq | F32Eq | F64Eq => "==",
		I32Ne | I64Ne | F32Ne | F64Ne => "!=",
		I32LtS | I32LtU | I64LtS | I64LtU | F32Lt | F64Lt => "<",
		I32GtS | I32GtU | I64GtS | I64GtU | F32Gt | F64Gt => ">",
		I32LeS | I32LeU | I64LeS | I64LeU | F32Le | F64Le => "<=",
		I32GeS | I32GeU | I64GeS | I64GeU | F32Ge | F64Ge => ">=",
		I32Add | I64Add | F32Add | F64Add => "+",
		I32Sub | I64Sub | F32Sub | F64Sub => "-",
		I32Mul | I64Mul | F32Mul | F64Mul => "*",
		I32DivS | I32DivU | I64DivS | I64DivU | F32Div | F64Div => "/",
		I32RemS | I32RemU | I64RemS | I64RemU => "%",
		I32And | I64And => "&",
		I32Or | I64Or => "|",
		I32Xor | I64Xor => "^",
		I32Shl | I64Shl => "<<",
		I32ShrS | I32ShrU | I64ShrS | I64ShrU => ">>",
		_ => return None,
	})
}

/// Operations without a C operator render as helper function calls.
fn call_wrapper(opcode: Opcode) -> Option<(&'static str, usize)> {
	use Opcode::*;
	Some(match opcode {
		I32Clz => ("int32_count_leading_zero_bits", 1),
		I32Ctz => ("int32_count_trailing_zero_bits", 1),
		I32Popcnt => ("int32_count_one_bits", 1),
		I64Clz => ("int64_count_leading_zero_bits", 1),
		I64Ctz => ("int64_count_trailing_zero_bits", 1),
		I64Popcnt => ("int64_count_one_bits", 1),
		I32Rotl | I64Rotl => ("int_rotl", 2),
		I32Rotr | I64Rotr => ("int_rotr", 2),
		F32Abs | F64Abs => ("__abs", 1),
		F32Ceil | F64Ceil => ("__ceil", 1),
		F32Floor | F64Floor => ("__floor", 1),
		F32Trunc | F64Trunc => ("__trunc", 1),
		F32Nearest | F64Nearest => ("__nearest", 1),
		F32Sqrt | F64Sqrt => ("__sqrt", 1),
		F32Min | F64Min => ("__min", 2),
		F32Max | F64Max => ("__max", 2),
		F32Copysign | F64Copysign => ("__copysign", 2),
		I32ReinterpretF32 => ("__reinterpret_int32", 1),
		I64ReinterpretF64 => ("__reinterpret_int64", 1),
		F32ReinterpretI32 => ("__reinterpret_float", 1),
		F64ReinterpretI64 => ("__reinterpret_double", 1),
		_ => return None,
	})
}

/// Width and representation changes render as C casts of the result type.
fn cast_target(opcode: Opcode) -> Option<ValueType> {
	use Opcode::*;
	Some(match opcode {
		I32WrapI64 | I32TruncF32S | I32TruncF32U | I32TruncF64S | I32TruncF64U => ValueType::I32,
		I64ExtendI32S | I64ExtendI32U | I64TruncF32S | I64TruncF32U | I64TruncF64S
		| I64TruncF64U => ValueType::I64,
		F32ConvertI32S | F32ConvertI32U | F32ConvertI64S | F32ConvertI64U | F32DemoteF64 => {
			ValueType::F32
		}
		F64ConvertI32S | F64ConvertI32U | F64ConvertI64S | F64ConvertI64U | F64PromoteF32 => {
			ValueType::F64
		}
		_ => return None,
	})
}

impl Decompiler for StructuredDecompiler<'_> {
	fn prepare(&mut self) -> Result<(), DecompileError> {
		for global in self.disasm.globals() {
			let keyword = match global.is_const {
				true => "const",
				false => "let",
			};
			self.output.push_str(&format!(
				"{} {} = {}; /* type: {} */\n",
				keyword, global.name, global.value, global.type_name,
			));
		}
		if !self.disasm.globals().is_empty() {
			self.output.push('\n');
		}
		Ok(())
	}

	fn decompile_function(&mut self, function: &Function) -> Result<(), DecompileError> {
		let _span = debug_span!("function", index = function.index, name = %function.name).entered();

		let params = function
			.parameters()
			.map(|local| local.name.as_str())
			.collect::<Vec<_>>()
			.join(", ");

		let body = match &function.body {
			None => {
				self.append_line(&format!("function {}({});", function.name, params), 0);
				self.output.push('\n');
				return Ok(());
			}
			Some(body) => body.clone(),
		};

		let mut header = format!("function {}({})", function.name, params);
		if let Some(exported) = &function.exported_name {
			header.push_str(&format!(" /* export: \"{}\" */", exported));
		}
		header.push_str(" {");
		self.append_line(&header, 0);

		let mut declared = false;
		for local in function.locals.iter().filter(|local| !local.is_parameter) {
			let zero = zero_value(local.value_type)?;
			self.append_line(&format!("let {} = {};", local.name, zero), 1);
			declared = true;
		}
		if declared {
			self.output.push('\n');
		}

		let mut state = DecodeState {
			function,
			stack: Vec::new(),
			branches: vec![BranchFrame {
				label: "block_0".to_owned(),
				block_type: function.return_type,
				is_loop: false,
			}],
			depth: 1,
			counter: 0,
			inside_if: false,
		};
		let mut reader = ByteReader::new(body);
		self.decode_block(&mut state, &mut reader)?;

		self.append_line("}", 0);
		self.output.push('\n');
		Ok(())
	}

	fn build_output(&mut self) -> String {
		std::mem::take(&mut self.output)
	}
}

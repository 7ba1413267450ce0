use std::fmt;
use crate::parse::ValueType;

/// One entry of the symbolic operand stack: a literal, a reference to a
/// local or global, or a folded expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
	I32(i32),
	I64(i64),
	F32(f32),
	F64(f64),
	Local { name: String, value_type: ValueType },
	Global { name: String },
	Expression(Box<Expression>),
	/// Placeholder for "no value"; renders as the empty string.
	Void,
}

impl Operand {
	/// Whether this entry can stand in for a value of `value_type`: locals
	/// must match exactly, literals by their host type, expressions always.
	pub fn matches_type(&self, value_type: ValueType) -> bool {
		match self {
			Operand::Expression(_) => true,
			Operand::Local { value_type: local_type, .. } => *local_type == value_type,
			Operand::I32(_) => value_type == ValueType::I32,
			Operand::I64(_) => value_type == ValueType::I64,
			Operand::F32(_) => value_type == ValueType::F32,
			Operand::F64(_) => value_type == ValueType::F64,
			Operand::Global { .. } | Operand::Void => false,
		}
	}

	pub fn is_function_call(&self) -> bool {
		matches!(self, Operand::Expression(expression) if expression.kind == ExpressionKind::FunctionCall)
	}
}

impl fmt::Display for Operand {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Operand::I32(value) => write!(f, "{}", value),
			Operand::I64(value) => write!(f, "{}", value),
			Operand::F32(value) => write!(f, "{:?}", value),
			Operand::F64(value) => write!(f, "{:?}", value),
			Operand::Local { name, .. } => write!(f, "{}", name),
			Operand::Global { name } => write!(f, "{}", name),
			Operand::Expression(expression) => write!(f, "{}", expression),
			Operand::Void => Ok(()),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionKind {
	Unary,
	Binary,
	Ternary,
	FunctionCall,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
	/// Operator text, or the callee for function calls.
	pub op: Option<String>,
	pub kind: ExpressionKind,
	pub operands: Vec<Operand>,
}

impl Expression {
	pub fn unary(op: impl Into<String>, operand: Operand) -> Operand {
		Operand::Expression(Box::new(Expression {
			op: Some(op.into()),
			kind: ExpressionKind::Unary,
			operands: vec![operand],
		}))
	}

	pub fn binary(lhs: Operand, op: impl Into<String>, rhs: Operand) -> Operand {
		Operand::Expression(Box::new(Expression {
			op: Some(op.into()),
			kind: ExpressionKind::Binary,
			operands: vec![lhs, rhs],
		}))
	}

	pub fn ternary(condition: Operand, when_true: Operand, when_false: Operand) -> Operand {
		Operand::Expression(Box::new(Expression {
			op: None,
			kind: ExpressionKind::Ternary,
			operands: vec![condition, when_true, when_false],
		}))
	}

	pub fn call(callee: impl Into<String>, args: Vec<Operand>) -> Operand {
		Operand::Expression(Box::new(Expression {
			op: Some(callee.into()),
			kind: ExpressionKind::FunctionCall,
			operands: args,
		}))
	}
}

/// Renders an operand of a compound expression. Nested compound expressions
/// get parentheses so the text keeps the tree's evaluation order; function
/// calls and leaves delimit themselves.
struct Grouped<'a>(&'a Operand);

impl fmt::Display for Grouped<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.0 {
			Operand::Expression(expression) if expression.kind != ExpressionKind::FunctionCall => {
				write!(f, "({})", expression)
			}
			operand => write!(f, "{}", operand),
		}
	}
}

impl fmt::Display for Expression {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let op = self.op.as_deref().unwrap_or("");
		match self.kind {
			ExpressionKind::Unary => write!(f, "{}{}", op, Grouped(&self.operands[0])),
			ExpressionKind::Binary => write!(
				f,
				"{} {} {}",
				Grouped(&self.operands[0]),
				op,
				Grouped(&self.operands[1]),
			),
			ExpressionKind::Ternary => write!(
				f,
				"{} ? {} : {}",
				Grouped(&self.operands[0]),
				Grouped(&self.operands[1]),
				Grouped(&self.operands[2]),
			),
			ExpressionKind::FunctionCall => {
				write!(f, "{}(", op)?;
				for (i, operand) in self.operands.iter().enumerate() {
					if i > 0 {
						write!(f, ", ")?;
					}
					write!(f, "{}", operand)?;
				}
				write!(f, ")")
			}
		}
	}
}

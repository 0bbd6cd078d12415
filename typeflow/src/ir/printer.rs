//! Text rendering of graphs

use std::fmt;

use super::{Graph, NullCheck, Opcode, Terminator};

fn null_check_suffix(null_check: NullCheck) -> &'static str {
    match null_check {
        NullCheck::WithNullCheck => "",
        NullCheck::WithoutNullCheck => " unchecked",
    }
}

fn list<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Parameter { index } => write!(f, "Parameter({index})"),
            Opcode::GlobalGet { global } => write!(f, "GlobalGet({global})"),
            Opcode::RefFunc { function } => write!(f, "RefFunc({function})"),
            Opcode::AllocateStruct { type_index, fields } => {
                write!(f, "AllocateStruct {type_index}({})", list(fields))
            }
            Opcode::AllocateArray { type_index, length } => {
                write!(f, "AllocateArray {type_index}({length})")
            }
            Opcode::Null { ty } => write!(f, "Null {ty}"),
            Opcode::IsNull { object, ty } => write!(f, "IsNull({object}) {ty}"),
            Opcode::AssertNotNull { object, ty, trap } => {
                write!(f, "AssertNotNull({object}) {ty} trap={trap}")
            }
            Opcode::TypeCast { object, config } => {
                write!(f, "TypeCast({object}) {} -> {}", config.from, config.to)
            }
            Opcode::TypeCheck { object, config } => {
                write!(f, "TypeCheck({object}) {} -> {}", config.from, config.to)
            }
            Opcode::StructGet {
                object,
                type_index,
                field_index,
                is_signed,
                null_check,
            } => write!(
                f,
                "StructGet({object}) {type_index}.{field_index}{}{}",
                if *is_signed { "" } else { " unsigned" },
                null_check_suffix(*null_check)
            ),
            Opcode::StructSet {
                object,
                value,
                type_index,
                field_index,
                null_check,
            } => write!(
                f,
                "StructSet({object}, {value}) {type_index}.{field_index}{}",
                null_check_suffix(*null_check)
            ),
            Opcode::ArrayLength { array, null_check } => {
                write!(f, "ArrayLength({array}){}", null_check_suffix(*null_check))
            }
            Opcode::Word32Constant { value } => write!(f, "Word32Constant({value})"),
            Opcode::Word32Equal { left, right } => write!(f, "Word32Equal({left}, {right})"),
            Opcode::TrapIf {
                condition,
                negated,
                trap,
            } => {
                let name = if *negated { "TrapIfNot" } else { "TrapIf" };
                write!(f, "{name}({condition}) trap={trap}")
            }
            Opcode::Phi { inputs } => write!(f, "Phi({})", list(inputs)),
            Opcode::ExternConvertAny { object } => write!(f, "ExternConvertAny({object})"),
            Opcode::AnyConvertExtern { object } => write!(f, "AnyConvertExtern({object})"),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Goto(target) => write!(f, "goto {target}"),
            Terminator::Branch {
                condition,
                if_true,
                if_false,
            } => write!(f, "branch {condition} ? {if_true} : {if_false}"),
            Terminator::Return(Some(value)) => write!(f, "return {value}"),
            Terminator::Return(None) => write!(f, "return"),
            Terminator::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block_index in self.block_indices() {
            let block = self.block(block_index);
            if block.predecessors.is_empty() {
                writeln!(f, "{block_index}:")?;
            } else {
                writeln!(f, "{block_index}: <- {}", list(&block.predecessors))?;
            }
            for &op in &block.operations {
                let opcode = &self.op(op).opcode;
                if opcode.produces_value() {
                    writeln!(f, "  {op} = {opcode}")?;
                } else {
                    writeln!(f, "  {opcode}")?;
                }
            }
            writeln!(f, "  {}", block.terminator)?;
        }
        Ok(())
    }
}

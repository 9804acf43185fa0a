use crate::bytecode::op::Op;
use crate::bytecode::seg::CodeSeg;

/// Render one segment as mnemonic-per-line text, for tests and debug
/// dumps. Operands are decoded with the same framing the interpreter
/// uses; jump offsets are shown as absolute targets.
pub fn disasm(seg: &CodeSeg) -> String {
    let mut out = String::new();
    let mut ip = 0;
    while ip < seg.len() {
        out.push_str(&disasm_at(seg, ip));
        out.push('\n');
        ip += seg.op_at(ip).total_len();
    }
    out
}

fn disasm_at(seg: &CodeSeg, ip: usize) -> String {
    let op = seg.op_at(ip);
    let operands = match op {
        Op::LoadChar => format!(" '{}'", seg.u8_at(ip + 1) as char),
        Op::LoadByte => format!(" {}", seg.u8_at(ip + 1)),
        Op::LoadInt => format!(" {}", seg.i64_at(ip + 1)),
        Op::LoadEmpty | Op::LoadTypeRef | Op::Cast | Op::IsType => {
            format!(" type#{}", seg.u32_at(ip + 1))
        }
        Op::LoadConst => format!(" {}", seg.const_at(seg.u8_at(ip + 1) as usize)),
        Op::LoadConst2 => format!(" {}", seg.const_at(seg.u16_at(ip + 1) as usize)),
        Op::Assert => format!(" {}", seg.const_at(seg.u16_at(ip + 1) as usize)),
        Op::LoadLocal | Op::StoreLocal | Op::LeaLocal => {
            format!(" {}", seg.i8_at(ip + 1))
        }
        Op::LoadSelfVar | Op::StoreSelfVar | Op::LeaSelfVar | Op::LoadOuterVar
        | Op::StoreOuterVar | Op::LeaOuterVar | Op::LoadMember | Op::StoreMember
        | Op::LeaMember => format!(" {}", seg.u8_at(ip + 1)),
        Op::LoadStatic | Op::StoreStatic | Op::LeaStatic => {
            format!(" {}.{}", seg.u8_at(ip + 1), seg.u8_at(ip + 2))
        }
        Op::Jump | Op::JumpTrue | Op::JumpFalse | Op::JumpOr | Op::JumpAnd => {
            let d = seg.i16_at(ip + 1) as i64;
            format!(" -> {}", ip as i64 + 3 + d)
        }
        Op::SiblingCall | Op::ChildCall | Op::MethodCall => {
            format!(" state#{}", seg.u32_at(ip + 1))
        }
        Op::LineNum => format!(" {}", seg.u16_at(ip + 1)),
        _ => String::new(),
    };
    format!("{:04}  {:?}{}", ip, op, operands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Value;

    #[test]
    fn test_disasm_operands() {
        let mut seg = CodeSeg::new(None);
        seg.add_op(Op::LoadByte);
        seg.add_u8(42);
        let idx = seg.add_const(Value::str("hi"));
        seg.add_op(Op::LoadConst);
        seg.add_u8(idx as u8);
        seg.add_op(Op::JumpFalse);
        seg.add_i16(1);
        seg.add_op(Op::Pop);
        seg.close(2);
        let text = disasm(&seg);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "0000  LoadByte 42");
        assert_eq!(lines[1], "0002  LoadConst 'hi'");
        assert_eq!(lines[2], "0004  JumpFalse -> 8");
        assert_eq!(lines[3], "0007  Pop");
        assert_eq!(lines[4], "0008  End");
    }
}

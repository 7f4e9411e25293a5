//! Opaque action-buffer AST (§4.4): one statement per `;`-terminated
//! action-string clause. This is a bounded subset of the real action
//! library's grammar, covering every statement the controller's own
//! generators (§4.8, §4.9) and the logical flows in §8 actually need.

use compact_str::CompactString;
use lpft_expr::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    /// `next;` / `next(N);`: resubmit to the next (or explicit) logical
    /// table.
    Next(Option<u8>),
    Drop,
    Output(CompactString),
    /// `regN = value;`.
    SetReg(u8, Value),
    CtNext,
    CtCommit,
    CtDnat(Option<Value>),
    CtSnat(Option<Value>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionBuffer(pub Vec<Stmt>);

/// Opaque identifier handed to the selector on `add`/`modify` and handed
/// back in every `Event`. The reactor packs a slot-table index in here, not
/// a raw pointer, so a stale token can never dereference freed memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}

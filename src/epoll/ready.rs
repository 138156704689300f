use bitflags::bitflags;

bitflags! {
    /// A set of readiness events reported by the selector.
    ///
    /// Only `READABLE` and `WRITABLE` are guaranteed on all backends; `ERROR`
    /// and `HUP` should be treated as hints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub struct Ready: usize {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR    = 0b0100;
        const HUP      = 0b1000;
    }
}

impl Ready {
    #[inline]
    pub fn readable() -> Ready {
        Ready::READABLE
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready::WRITABLE
    }

    #[inline]
    pub fn error() -> Ready {
        Ready::ERROR
    }

    #[inline]
    pub fn hup() -> Ready {
        Ready::HUP
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::READABLE)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready::ERROR)
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Ready::HUP)
    }

    pub fn as_usize(&self) -> usize {
        self.bits()
    }
}

impl From<usize> for Ready {
    fn from(bits: usize) -> Ready {
        Ready::from_bits_truncate(bits)
    }
}

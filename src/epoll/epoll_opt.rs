use bitflags::bitflags;

bitflags! {
    /// Registration options controlling how the selector reports a source's
    /// readiness.
    ///
    /// The reactor always registers with `LEVEL | ONESHOT`: level-triggered
    /// so a handler that doesn't fully drain a socket in one poll sees it
    /// again without needing to track partial-read state across callbacks,
    /// and oneshot so a socket never fires on two threads/iterations before
    /// the handler has re-armed it (see `Reactor::rearm`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub struct EpollOpt: usize {
        const EDGE    = 0b0001;
        const LEVEL   = 0b0010;
        const ONESHOT = 0b0100;
    }
}

impl EpollOpt {
    #[inline]
    pub fn edge() -> EpollOpt {
        EpollOpt::EDGE
    }

    #[inline]
    pub fn level() -> EpollOpt {
        EpollOpt::LEVEL
    }

    #[inline]
    pub fn oneshot() -> EpollOpt {
        EpollOpt::ONESHOT
    }

    #[inline]
    pub fn is_edge(self) -> bool {
        self.contains(EpollOpt::EDGE)
    }

    #[inline]
    pub fn is_level(self) -> bool {
        self.contains(EpollOpt::LEVEL)
    }

    #[inline]
    pub fn is_oneshot(self) -> bool {
        self.contains(EpollOpt::ONESHOT)
    }

    pub fn as_usize(self) -> usize {
        self.bits()
    }
}

impl From<usize> for EpollOpt {
    fn from(bits: usize) -> EpollOpt {
        EpollOpt::from_bits_truncate(bits)
    }
}

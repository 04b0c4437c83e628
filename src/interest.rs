use std::fmt;
use std::ops;

/// Interest to register with the event loop when watching a descriptor.
///
/// Interests are a bitwise-or of [`READ`] and [`WRITE`]. [`ERROR`] is
/// always implied by the loop at registration time (see
/// [`EventLoop::add_handler`]) and never needs to be requested explicitly,
/// but it is exposed here because [`ReadyEvent`] reports it back.
///
/// [`READ`]: Interest::READ
/// [`WRITE`]: Interest::WRITE
/// [`ERROR`]: Interest::ERROR
/// [`EventLoop::add_handler`]: crate::reactor::EventLoop::add_handler
/// [`ReadyEvent`]: crate::event::ReadyEvent
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interest(u8);

const READ: u8 = 0b001;
const WRITE: u8 = 0b010;
const ERROR: u8 = 0b100;

impl Interest {
    /// Readable readiness.
    pub const READ: Interest = Interest(READ);
    /// Writable readiness.
    pub const WRITE: Interest = Interest(WRITE);
    /// Error readiness. Always implied once a descriptor is registered.
    pub const ERROR: Interest = Interest(ERROR);
    /// No interest at all.
    pub const NONE: Interest = Interest(0);

    pub const fn is_readable(self) -> bool {
        self.0 & READ != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WRITE != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Combine two interests. `const fn` equivalent of `BitOr`.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        macro_rules! flag {
            ($name:expr, $test:expr) => {
                if $test {
                    if !first {
                        write!(f, " | ")?;
                    }
                    write!(f, $name)?;
                    first = false;
                }
            };
        }
        flag!("READ", self.is_readable());
        flag!("WRITE", self.is_writable());
        flag!("ERROR", self.is_error());
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open-flag strings and their parsed form

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::stats::{R_OK, W_OK};

/// Parsed open flags. The string forms follow the classic `fopen`-style
/// table: `r, rs, r+, w, wx, w+, wx+, a, ax, a+, ax+`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    pub readable: bool,
    pub writable: bool,
    pub appendable: bool,
    pub truncate: bool,
    pub exclusive: bool,
    pub create: bool,
    /// `rs`: reads bypass any backend caching layer.
    pub synchronous: bool,
}

impl OpenFlags {
    pub fn parse(flag: &str) -> FsResult<Self> {
        let flags = match flag {
            "r" => Self {
                readable: true,
                ..Self::default()
            },
            "rs" | "sr" => Self {
                readable: true,
                synchronous: true,
                ..Self::default()
            },
            "r+" => Self {
                readable: true,
                writable: true,
                ..Self::default()
            },
            "rs+" | "sr+" => Self {
                readable: true,
                writable: true,
                synchronous: true,
                ..Self::default()
            },
            "w" => Self {
                writable: true,
                truncate: true,
                create: true,
                ..Self::default()
            },
            "wx" | "xw" => Self {
                writable: true,
                truncate: true,
                create: true,
                exclusive: true,
                ..Self::default()
            },
            "w+" => Self {
                readable: true,
                writable: true,
                truncate: true,
                create: true,
                ..Self::default()
            },
            "wx+" | "w+x" | "xw+" => Self {
                readable: true,
                writable: true,
                truncate: true,
                create: true,
                exclusive: true,
                ..Self::default()
            },
            "a" => Self {
                writable: true,
                appendable: true,
                create: true,
                ..Self::default()
            },
            "ax" | "xa" => Self {
                writable: true,
                appendable: true,
                create: true,
                exclusive: true,
                ..Self::default()
            },
            "a+" => Self {
                readable: true,
                writable: true,
                appendable: true,
                create: true,
                ..Self::default()
            },
            "ax+" | "a+x" | "xa+" => Self {
                readable: true,
                writable: true,
                appendable: true,
                create: true,
                exclusive: true,
                ..Self::default()
            },
            _ => {
                return Err(FsError::invalid(flag).with_syscall("open"));
            }
        };
        Ok(flags)
    }

    /// The access mask (`R_OK | W_OK`) an open with these flags demands.
    pub fn access_mask(&self) -> u32 {
        let mut mask = 0;
        if self.readable {
            mask |= R_OK;
        }
        if self.writable || self.appendable {
            mask |= W_OK;
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_flags() {
        let r = OpenFlags::parse("r").unwrap();
        assert!(r.readable && !r.writable && !r.create);

        let rp = OpenFlags::parse("r+").unwrap();
        assert!(rp.readable && rp.writable && !rp.create && !rp.truncate);

        let rs = OpenFlags::parse("rs").unwrap();
        assert!(rs.readable && rs.synchronous);
    }

    #[test]
    fn write_flags() {
        let w = OpenFlags::parse("w").unwrap();
        assert!(w.writable && w.truncate && w.create && !w.readable);

        let wx = OpenFlags::parse("wx").unwrap();
        assert!(wx.exclusive && wx.truncate);

        let wp = OpenFlags::parse("w+").unwrap();
        assert!(wp.readable && wp.writable && wp.truncate);
    }

    #[test]
    fn append_flags() {
        let a = OpenFlags::parse("a").unwrap();
        assert!(a.writable && a.appendable && a.create && !a.truncate);

        let axp = OpenFlags::parse("ax+").unwrap();
        assert!(axp.readable && axp.appendable && axp.exclusive);
    }

    #[test]
    fn unknown_flag_is_invalid() {
        assert_eq!(
            OpenFlags::parse("z").unwrap_err().kind,
            crate::error::ErrorKind::InvalidArgument
        );
        assert!(OpenFlags::parse("").is_err());
    }

    #[test]
    fn access_masks() {
        assert_eq!(OpenFlags::parse("r").unwrap().access_mask(), R_OK);
        assert_eq!(OpenFlags::parse("w").unwrap().access_mask(), W_OK);
        assert_eq!(OpenFlags::parse("r+").unwrap().access_mask(), R_OK | W_OK);
        assert_eq!(OpenFlags::parse("a").unwrap().access_mask(), W_OK);
    }
}

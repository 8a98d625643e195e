use core::fmt;
use std::io::IoSliceMut;

use libc::user_regs_struct;
use nix::{
    errno::Errno,
    sys::{
        ptrace,
        uio::{process_vm_readv, RemoteIoVec},
    },
    unistd::Pid,
};

use crate::diag::{Error, Result};

const PAGE_SIZE: u64 = 4096;
/// Longest string accepted from the tracee, terminator included.
const PATH_MAX: usize = libc::PATH_MAX as usize;

/// Registers the engine needs, named after their `x86_64` role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    /// Syscall number, preserved by the kernel across the call.
    OrigRax,
    /// Return value on syscall exit.
    Rax,
    Rdi,
    Rsi,
    Rdx,
    R10,
    R8,
    R9,
}

/// Syscall argument registers in calling-convention order.
pub const ARGS: [Register; 6] = [
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::R10,
    Register::R8,
    Register::R9,
];

/// Access to a stopped tracee's registers and memory.
///
/// This is the only architecture-specific seam: everything above it deals
/// in syscall numbers, arguments and strings.
pub trait Inferior {
    /// # Errors
    ///
    /// Returns `Err` if the register cannot be read.
    fn register(&self, reg: Register) -> Result<u64>;

    /// Read up to `len` bytes at `addr`. Fewer bytes are returned when the
    /// range runs into unmapped memory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if nothing at all can be read at `addr`.
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// # Errors
    ///
    /// Returns `Err` if the register cannot be read.
    fn syscall_no(&self) -> Result<i64> {
        Ok(i64::from_ne_bytes(
            self.register(Register::OrigRax)?.to_ne_bytes(),
        ))
    }

    /// # Errors
    ///
    /// Returns `Err` if the register cannot be read.
    fn arg(&self, index: usize) -> Result<u64> {
        let reg = ARGS
            .get(index)
            .ok_or_else(|| Error::from(format!("Error: no syscall argument {index}")))?;
        self.register(*reg)
    }

    /// Syscall result: negative values are `-errno`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the register cannot be read.
    fn ret(&self) -> Result<i64> {
        Ok(i64::from_ne_bytes(self.register(Register::Rax)?.to_ne_bytes()))
    }

    /// Read a NUL-terminated UTF-8 string, one page at a time so a string
    /// ending just before an unmapped page is still readable.
    ///
    /// # Errors
    ///
    /// Returns an unsupported error for unreadable memory, strings longer
    /// than `PATH_MAX` and non-UTF-8 bytes.
    fn read_str(&self, addr: u64) -> Result<String> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        while bytes.len() < PATH_MAX {
            let in_page = PAGE_SIZE - cursor % PAGE_SIZE;
            let want = usize::try_from(in_page)?.min(PATH_MAX - bytes.len());
            let chunk = self
                .read(cursor, want)
                .map_err(|e| Error::unsupported(format!("string at {addr:#x}: {}", e.message())))?;
            if chunk.is_empty() {
                return Err(Error::unsupported(format!("string at {addr:#x}: {}", Errno::EFAULT)));
            }

            if let Some(end) = chunk.iter().position(|b| *b == 0) {
                bytes.extend_from_slice(&chunk[..end]);
                return String::from_utf8(bytes)
                    .map_err(|_| Error::unsupported(format!("non UTF-8 string at {addr:#x}")));
            }
            bytes.extend_from_slice(&chunk);
            cursor += chunk.len() as u64;
        }
        Err(Error::unsupported(format!("string at {addr:#x}: {}", Errno::ENAMETOOLONG)))
    }
}

/// Register snapshot of a stopped tracee, plus live access to its memory.
///
/// Currently this assumes the `x86_64` register layout.
pub struct Registers {
    pid: Pid,
    regs: user_regs_struct,
}

impl Registers {
    /// Read the current register state for `pid`.
    ///
    /// # Arguments
    ///
    /// * `pid` - The traced thread, which must be in a ptrace stop.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `ptrace::getregs` call fails.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Registers` snapshot on success.
    pub fn read(pid: Pid) -> Result<Self> {
        Ok(Self {
            pid,
            regs: ptrace::getregs(pid)?,
        })
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl Inferior for Registers {
    fn register(&self, reg: Register) -> Result<u64> {
        Ok(match reg {
            Register::OrigRax => self.regs.orig_rax,
            Register::Rax => self.regs.rax,
            Register::Rdi => self.regs.rdi,
            Register::Rsi => self.regs.rsi,
            Register::Rdx => self.regs.rdx,
            Register::R10 => self.regs.r10,
            Register::R8 => self.regs.r8,
            Register::R9 => self.regs.r9,
        })
    }

    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let remote = [RemoteIoVec {
            base: usize::try_from(addr)?,
            len,
        }];
        let n = process_vm_readv(self.pid, &mut [IoSliceMut::new(&mut buf)], &remote)?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "orig_rax: {:#x}, rax: {:#x}, args: [{:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}]",
            self.regs.orig_rax,
            self.regs.rax,
            self.regs.rdi,
            self.regs.rsi,
            self.regs.rdx,
            self.regs.r10,
            self.regs.r8,
            self.regs.r9
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use fake::Fake;
    use nix::unistd::getpid;
    use std::ffi::CString;

    fn make_regs() -> user_regs_struct {
        user_regs_struct {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbp: 0x2000,
            rbx: 0x3000,
            r11: 0,
            r10: 9,
            r9: 11,
            r8: 10,
            rax: (-2i64) as u64,
            rcx: 2,
            rdx: 3,
            rsi: 4,
            rdi: 5,
            orig_rax: 257,
            rip: 0x1000,
            cs: 0,
            eflags: 0,
            rsp: 0x4000,
            ss: 0,
            fs_base: 0,
            gs_base: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
        }
    }

    #[test]
    fn test_registers_accessors_and_display() {
        let r = Registers {
            pid: Pid::from_raw(1),
            regs: make_regs(),
        };
        assert_eq!(r.syscall_no().expect("no"), 257);
        assert_eq!(r.ret().expect("ret"), -2);
        let args: Vec<u64> = (0..6).map(|i| r.arg(i).expect("arg")).collect();
        assert_eq!(args, vec![5, 4, 3, 9, 10, 11]);
        assert!(r.arg(6).is_err());

        let s = format!("{}", r);
        assert!(s.contains("orig_rax: 0x101"));
    }

    #[test]
    fn test_read_str_own_memory() {
        let text = CString::new("/etc/hostname").expect("cstring");
        let me = Registers {
            pid: getpid(),
            regs: make_regs(),
        };
        let addr = text.as_ptr() as u64;
        assert_eq!(me.read_str(addr).expect("read"), "/etc/hostname");
    }

    #[test]
    fn test_read_str_across_pages() {
        let start = PAGE_SIZE - 3;
        let fake = Fake::default()
            .with_bytes(start, b"abc")
            .with_bytes(PAGE_SIZE, b"def\0");
        assert_eq!(fake.read_str(start).expect("read"), "abcdef");
    }

    #[test]
    fn test_read_str_failures() {
        let fake = Fake::default().with_bytes(0x1000, &[b'a'; 16]);
        assert!(fake.read_str(0x1000).expect_err("unterminated").is_unsupported());
        assert!(fake.read_str(0x9000).expect_err("unmapped").is_unsupported());

        let fake = Fake::default().with_bytes(0x1000, &[0xff, 0xfe, 0]);
        assert!(fake.read_str(0x1000).expect_err("utf-8").is_unsupported());

        let long = "x".repeat(PATH_MAX + 10);
        let fake = Fake::default().with_str(0x1000, &long);
        assert!(fake.read_str(0x1000).expect_err("too long").is_unsupported());
    }
}

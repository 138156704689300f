use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use super::common::{AsInner, FromInner, IntoInner};
use super::syscall;

#[derive(Debug)]
pub struct FileDesc {
    file: File,
    fd: RawFd,
}

impl FileDesc {
    pub fn new(fd: RawFd) -> Self {
        FileDesc {
            file: unsafe { File::from_raw_fd(fd) },
            fd,
        }
    }

    pub fn try_clone(&self) -> io::Result<FileDesc> {
        let file = self.file.try_clone()?;
        let fd = file.as_raw_fd();
        Ok(FileDesc { file, fd })
    }

    pub fn duplicate(&self) -> io::Result<FileDesc> {
        let fd = syscall!(fcntl(self.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0))?;
        Ok(FileDesc::new(fd))
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        syscall!(ioctl(self.as_raw_fd(), libc::FIOCLEX))?;
        Ok(())
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc::new(fd)
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.file.into_raw_fd()
    }
}

impl AsInner<libc::c_int> for FileDesc {
    fn as_inner(&self) -> &libc::c_int {
        &self.fd
    }
}

impl FromInner<libc::c_int> for FileDesc {
    fn from_inner(fd: libc::c_int) -> FileDesc {
        FileDesc::new(fd)
    }
}

impl IntoInner<libc::c_int> for FileDesc {
    fn into_inner(self) -> libc::c_int {
        self.file.into_raw_fd()
    }
}

impl Read for FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }
}

impl Write for FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FileDesc {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Seek for &FileDesc {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        (&self.file).seek(pos)
    }
}

impl FileExt for FileDesc {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_at(buf, offset)
    }
}

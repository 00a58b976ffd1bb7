//! Compiled-in syscall table.

use crate::HashMap;
use thiserror::Error;

pub type SyscallId = usize;

#[derive(Debug, Clone)]
pub struct Syscall {
    id: SyscallId,
    name: Box<str>,
}

impl Syscall {
    #[inline(always)]
    pub fn id(&self) -> SyscallId {
        self.id
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Error)]
#[error("unknown syscall: {0}")]
pub struct UnknownSyscall(pub String);

/// Name to id mapping for every syscall the manager understands.
///
/// Ids are dense and stable for the lifetime of the process; per-call
/// state (cumulative cover, priority rows) is indexed by them.
#[derive(Debug, Clone)]
pub struct SyscallTable {
    calls: Vec<Syscall>,
    by_name: HashMap<Box<str>, SyscallId>,
}

impl SyscallTable {
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Self {
        let calls: Vec<Syscall> = names
            .into_iter()
            .enumerate()
            .map(|(id, name)| Syscall {
                id,
                name: name.into(),
            })
            .collect();
        let by_name = calls
            .iter()
            .map(|call| (call.name.clone(), call.id))
            .collect();
        Self { calls, by_name }
    }

    pub fn builtin() -> Self {
        Self::new(BUILTIN_CALLS.iter().copied())
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.calls.len()
    }

    #[inline]
    pub fn id_of(&self, name: &str) -> Option<SyscallId> {
        self.by_name.get(name).copied()
    }

    #[inline]
    pub fn name_of(&self, id: SyscallId) -> Option<&str> {
        self.calls.get(id).map(|call| call.name())
    }

    pub fn calls(&self) -> &[Syscall] {
        &self.calls
    }

    /// Resolve configured syscall names to an enabled-id set. An empty
    /// list enables everything.
    pub fn resolve_enabled(
        &self,
        names: &[String],
    ) -> Result<crate::HashSet<SyscallId>, UnknownSyscall> {
        if names.is_empty() {
            return Ok((0..self.count()).collect());
        }
        let mut enabled = crate::HashSet::default();
        for name in names {
            let id = self
                .id_of(name)
                .ok_or_else(|| UnknownSyscall(name.clone()))?;
            enabled.insert(id);
        }
        Ok(enabled)
    }
}

static BUILTIN_CALLS: &[&str] = &[
    "read", "write", "open", "close", "stat", "fstat", "lstat", "poll", "lseek", "mmap",
    "mprotect", "munmap", "brk", "ioctl", "pread64", "pwrite64", "readv", "writev", "access",
    "pipe", "select", "sched_yield", "mremap", "msync", "mincore", "madvise", "shmget", "shmat",
    "shmctl", "dup", "dup2", "pause", "nanosleep", "getitimer", "alarm", "setitimer", "getpid",
    "sendfile", "socket", "connect", "accept", "sendto", "recvfrom", "sendmsg", "recvmsg",
    "shutdown", "bind", "listen", "getsockname", "getpeername", "socketpair", "setsockopt",
    "getsockopt", "clone", "fork", "vfork", "execve", "exit", "wait4", "kill", "uname", "semget",
    "semop", "semctl", "shmdt", "msgget", "msgsnd", "msgrcv", "msgctl", "fcntl", "flock", "fsync",
    "fdatasync", "truncate", "ftruncate", "getdents", "getcwd", "chdir", "fchdir", "rename",
    "mkdir", "rmdir", "creat", "link", "unlink", "symlink", "readlink", "chmod", "fchmod",
    "chown", "fchown", "umask", "gettimeofday", "getrlimit", "getrusage", "sysinfo", "times",
    "ptrace", "getuid", "syslog", "getgid", "setuid", "setgid", "geteuid", "getegid", "setpgid",
    "getppid", "getpgrp", "setsid", "setreuid", "setregid", "getgroups", "setgroups", "capget",
    "capset", "sigaltstack", "utime", "mknod", "personality", "ustat", "statfs", "fstatfs",
    "ioprio_set", "ioprio_get", "mlock", "munlock", "mlockall", "munlockall", "prctl",
    "arch_prctl", "chroot", "sync", "mount", "umount2", "reboot", "sethostname", "setdomainname",
    "iopl", "init_module", "delete_module", "quotactl", "gettid", "readahead", "setxattr",
    "lsetxattr", "fsetxattr", "getxattr", "lgetxattr", "fgetxattr", "listxattr", "llistxattr",
    "flistxattr", "removexattr", "lremovexattr", "fremovexattr", "tkill", "time", "futex",
    "sched_setaffinity", "sched_getaffinity", "io_setup", "io_destroy", "io_getevents",
    "io_submit", "io_cancel", "epoll_create", "getdents64", "set_tid_address", "restart_syscall",
    "semtimedop", "fadvise64", "timer_create", "timer_settime", "timer_gettime",
    "timer_getoverrun", "timer_delete", "clock_settime", "clock_gettime", "clock_getres",
    "clock_nanosleep", "exit_group", "epoll_wait", "epoll_ctl", "tgkill", "utimes", "mbind",
    "set_mempolicy", "get_mempolicy", "mq_open", "mq_unlink", "mq_timedsend", "mq_timedreceive",
    "mq_notify", "mq_getsetattr", "waitid", "add_key", "request_key", "keyctl", "inotify_init",
    "inotify_add_watch", "inotify_rm_watch", "openat", "mkdirat", "mknodat", "fchownat",
    "futimesat", "newfstatat", "unlinkat", "renameat", "linkat", "symlinkat", "readlinkat",
    "fchmodat", "faccessat", "pselect6", "ppoll", "unshare", "splice", "tee", "sync_file_range",
    "vmsplice", "move_pages", "utimensat", "epoll_pwait", "signalfd", "timerfd_create",
    "eventfd", "fallocate", "timerfd_settime", "timerfd_gettime", "accept4", "signalfd4",
    "eventfd2", "epoll_create1", "dup3", "pipe2", "inotify_init1", "preadv", "pwritev",
    "perf_event_open", "recvmmsg", "fanotify_init", "fanotify_mark", "prlimit64",
    "name_to_handle_at", "open_by_handle_at", "clock_adjtime", "syncfs", "sendmmsg", "setns",
    "getcpu", "process_vm_readv", "process_vm_writev", "kcmp", "finit_module",
    "sched_setattr", "sched_getattr", "renameat2", "seccomp", "getrandom", "memfd_create",
    "bpf", "execveat", "userfaultfd", "membarrier", "mlock2", "copy_file_range", "preadv2",
    "pwritev2", "pkey_mprotect", "pkey_alloc", "pkey_free", "statx",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_id_round_trip() {
        let table = SyscallTable::builtin();
        let id = table.id_of("read").unwrap();
        assert_eq!(table.name_of(id), Some("read"));
        assert!(table.id_of("no_such_call").is_none());
    }

    #[test]
    fn resolve_enabled_subset() {
        let table = SyscallTable::builtin();
        let enabled = table
            .resolve_enabled(&["read".to_string(), "write".to_string()])
            .unwrap();
        assert_eq!(enabled.len(), 2);
        assert!(enabled.contains(&table.id_of("read").unwrap()));
        assert!(!enabled.contains(&table.id_of("open").unwrap()));

        let all = table.resolve_enabled(&[]).unwrap();
        assert_eq!(all.len(), table.count());

        assert!(table.resolve_enabled(&["bogus".to_string()]).is_err());
    }
}

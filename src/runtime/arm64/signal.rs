//! Host memory-fault handling for JITted code.
//!
//! A process-wide SIGSEGV/SIGBUS handler is installed the first time an
//! address space registers its code buffer. When a fault's program counter
//! falls inside a registered buffer, the fault is an optimistic fastmem access
//! that missed: the owning address space synthesizes a [`FakeCall`] and the
//! handler rewrites the interrupted context so execution resumes at the
//! slow-path helper. Faults outside every registered buffer are forwarded to
//! whatever handler was installed before ours.
//!
//! Dispatch is by address range so multiple address spaces can coexist in one
//! process.

use super::address_space::AddressSpace;
use super::emit::FakeCall;
use libc::{c_int, siginfo_t};
use std::sync::{Mutex, Once};

struct CodeRegion {
    start: usize,
    end: usize,
    address_space: *mut AddressSpace,
}

// Raw pointers keep the registry !Send by default. Entries are only mutated
// from address-space construction and destruction, and only dereferenced by
// the fault handler on the thread that owns the address space.
unsafe impl Send for CodeRegion {}

struct PreviousActions {
    segv: libc::sigaction,
    bus: libc::sigaction,
}

unsafe impl Send for PreviousActions {}

static REGISTRY: Mutex<Vec<CodeRegion>> = Mutex::new(Vec::new());
static PREVIOUS: Mutex<Option<PreviousActions>> = Mutex::new(None);
static INSTALL: Once = Once::new();

/// Route faults inside `[start, end)` to `space`'s fastmem callback.
/// Installs the process-wide handler on first use.
pub(crate) fn register_code_region(space: *mut AddressSpace, start: usize, end: usize) {
    install_handlers();
    REGISTRY.lock().unwrap().push(CodeRegion {
        start,
        end,
        address_space: space,
    });
}

pub(crate) fn unregister_code_region(space: *const AddressSpace) {
    REGISTRY
        .lock()
        .unwrap()
        .retain(|region| region.address_space.cast_const() != space);
}

fn install_handlers() {
    INSTALL.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = fault_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut sa.sa_mask);

        let mut prev_segv: libc::sigaction = std::mem::zeroed();
        let mut prev_bus: libc::sigaction = std::mem::zeroed();
        libc::sigaction(libc::SIGSEGV, &sa, &mut prev_segv);
        libc::sigaction(libc::SIGBUS, &sa, &mut prev_bus);

        *PREVIOUS.lock().unwrap() = Some(PreviousActions {
            segv: prev_segv,
            bus: prev_bus,
        });
    });
}

fn find_address_space(regions: &[CodeRegion], pc: usize) -> Option<*mut AddressSpace> {
    regions
        .iter()
        .find(|region| pc >= region.start && pc < region.end)
        .map(|region| region.address_space)
}

/// # Safety
///
/// Called by the OS signal machinery. Dereferences the OS-provided context and
/// the registered address-space pointer. The registry lock is never contended
/// here: the registry is only mutated at address-space construction and
/// destruction, never while JITted code is on the stack.
unsafe extern "C" fn fault_handler(sig: c_int, info: *mut siginfo_t, context: *mut libc::c_void) {
    let pc = unsafe { context_pc(context) };

    let space = REGISTRY
        .lock()
        .ok()
        .and_then(|regions| find_address_space(&regions, pc as usize));

    if let Some(space) = space {
        let fake_call = unsafe { (*space).fastmem_callback(pc) };
        unsafe { install_fake_call(context, fake_call) };
        return;
    }

    unsafe { forward_to_previous(sig, info, context) };
}

/// Hand a fault we do not own to the handler that was installed before ours.
unsafe fn forward_to_previous(sig: c_int, info: *mut siginfo_t, context: *mut libc::c_void) {
    let previous = PREVIOUS.lock().ok().and_then(|p| {
        p.as_ref().map(|actions| match sig {
            libc::SIGSEGV => actions.segv,
            _ => actions.bus,
        })
    });

    let Some(action) = previous else {
        std::process::abort();
    };

    unsafe {
        if action.sa_flags & libc::SA_SIGINFO != 0 {
            let handler: extern "C" fn(c_int, *mut siginfo_t, *mut libc::c_void) =
                std::mem::transmute(action.sa_sigaction);
            handler(sig, info, context);
        } else if action.sa_sigaction == libc::SIG_DFL {
            // Restore the default action; the fault recurs on return and the
            // kernel applies it.
            libc::sigaction(sig, &action, std::ptr::null_mut());
        } else if action.sa_sigaction == libc::SIG_IGN {
            // Ignored; returning retries the faulting instruction.
        } else {
            let handler: extern "C" fn(c_int) = std::mem::transmute(action.sa_sigaction);
            handler(sig);
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn context_pc(context: *mut libc::c_void) -> u64 {
    let ctx = context as *mut libc::ucontext_t;
    unsafe { (*ctx).uc_mcontext.pc }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn install_fake_call(context: *mut libc::c_void, fake_call: FakeCall) {
    let ctx = context as *mut libc::ucontext_t;
    unsafe {
        (*ctx).uc_mcontext.pc = fake_call.call_target;
        (*ctx).uc_mcontext.pstate = fake_call.cpsr as u64;
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn context_pc(context: *mut libc::c_void) -> u64 {
    let ctx = context as *mut libc::ucontext_t;
    unsafe { (*(*ctx).uc_mcontext).__ss.__pc }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn install_fake_call(context: *mut libc::c_void, fake_call: FakeCall) {
    let ctx = context as *mut libc::ucontext_t;
    unsafe {
        (*(*ctx).uc_mcontext).__ss.__pc = fake_call.call_target;
        (*(*ctx).uc_mcontext).__ss.__cpsr = fake_call.cpsr;
    }
}

// Test builds on x86-64 hosts treat the buffer as data and never execute it,
// but the handler still has to compile; resume-at-helper maps to RIP.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn context_pc(context: *mut libc::c_void) -> u64 {
    let ctx = context as *mut libc::ucontext_t;
    unsafe { (*ctx).uc_mcontext.gregs[libc::REG_RIP as usize] as u64 }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn install_fake_call(context: *mut libc::c_void, fake_call: FakeCall) {
    let ctx = context as *mut libc::ucontext_t;
    unsafe {
        (*ctx).uc_mcontext.gregs[libc::REG_RIP as usize] = fake_call.call_target as i64;
    }
}

#[cfg(not(any(
    all(target_os = "linux", target_arch = "aarch64"),
    all(target_os = "macos", target_arch = "aarch64"),
    all(target_os = "linux", target_arch = "x86_64"),
)))]
unsafe fn context_pc(_context: *mut libc::c_void) -> u64 {
    // No mcontext accessor for this host; every fault forwards.
    0
}

#[cfg(not(any(
    all(target_os = "linux", target_arch = "aarch64"),
    all(target_os = "macos", target_arch = "aarch64"),
    all(target_os = "linux", target_arch = "x86_64"),
)))]
unsafe fn install_fake_call(_context: *mut libc::c_void, _fake_call: FakeCall) {
    unreachable!("no registered code region can match on this host");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: usize, end: usize, tag: usize) -> CodeRegion {
        CodeRegion {
            start,
            end,
            address_space: tag as *mut AddressSpace,
        }
    }

    #[test]
    fn dispatch_is_by_address_range() {
        let regions = vec![region(0x1000, 0x2000, 1), region(0x8000, 0x9000, 2)];

        assert_eq!(find_address_space(&regions, 0x1000), Some(1 as *mut _));
        assert_eq!(find_address_space(&regions, 0x1fff), Some(1 as *mut _));
        assert_eq!(find_address_space(&regions, 0x8800), Some(2 as *mut _));
        assert_eq!(find_address_space(&regions, 0x2000), None);
        assert_eq!(find_address_space(&regions, 0x0), None);
    }

    #[test]
    fn unregister_removes_only_the_matching_space() {
        REGISTRY.lock().unwrap().push(region(0x100000, 0x101000, 3));
        REGISTRY.lock().unwrap().push(region(0x200000, 0x201000, 4));

        unregister_code_region(3 as *const AddressSpace);

        let regions = REGISTRY.lock().unwrap();
        assert!(find_address_space(&regions, 0x100800).is_none());
        assert_eq!(find_address_space(&regions, 0x200800), Some(4 as *mut _));
        drop(regions);

        unregister_code_region(4 as *const AddressSpace);
    }
}

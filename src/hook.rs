//! Types for hooking game code through whatever hooking library the host provides.

use parking_lot::Mutex;
use std::marker::PhantomData;

#[derive(thiserror::Error, Debug)]
pub enum HookError {
    #[error("failed to hook {address:#x}: {reason}")]
    Install { address: usize, reason: String },

    #[error("failed to unhook {address:#x}: {reason}")]
    Remove { address: usize, reason: String },

    #[error("hook target {0:#x} was given a replacement that is not a function pointer")]
    BadSignature(usize),

    #[error("{0:#x} is not hooked")]
    NotInstalled(usize),
}

/// A hooking library. Replaces the code at a target address with a jump to a replacement, and
/// gives back a trampoline through which the original code can still be called.
pub trait HookInstaller: Send + Sync {
    /// Hooks `target`, returning the address of the trampoline.
    ///
    /// # Safety
    /// `target` must be the start of code that `replacement` can stand in for.
    unsafe fn install(&self, target: usize, replacement: usize) -> Result<usize, HookError>;

    /// Restores the original code at `target`.
    fn remove(&self, target: usize) -> Result<(), HookError>;
}

pub struct Hook<FnType> {
    address: usize,
    original_fn: Mutex<Option<usize>>,
    _signature: PhantomData<FnType>,
}

impl<FnType: Copy> Hook<FnType> {
    /// Creates a new hook for a function with the specified address. This does not install the
    /// hook.
    pub const fn new(address: usize) -> Hook<FnType> {
        Hook {
            address,
            original_fn: Mutex::new(None),
            _signature: PhantomData,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    /// Replaces the target function's implementation with that of the function given. The
    /// original function pointer can be obtained by calling `original()`.
    pub fn install(&self, installer: &dyn HookInstaller, replacement: FnType) -> Result<(), HookError> {
        if std::mem::size_of::<FnType>() != std::mem::size_of::<usize>() {
            return Err(HookError::BadSignature(self.address));
        }

        let replacement: usize = unsafe { std::mem::transmute_copy(&replacement) };

        // The address comes from the host layout, which describes the game binary we're loaded in.
        let trampoline = unsafe { installer.install(self.address, replacement) }?;

        *self.original_fn.lock() = Some(trampoline);
        log::info!("Hooked {:#x}", self.address);

        Ok(())
    }

    /// Removes the hook if it is installed.
    pub fn remove(&self, installer: &dyn HookInstaller) -> Result<(), HookError> {
        let mut original = self.original_fn.lock();

        if original.is_none() {
            return Err(HookError::NotInstalled(self.address));
        }

        installer.remove(self.address)?;
        *original = None;

        log::info!("Unhooked {:#x}", self.address);
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.original_fn.lock().is_some()
    }

    /// Returns a pointer to the original implementation of the hooked function, if the hook is
    /// installed and the hooking library gave us one.
    pub fn original(&self) -> Option<FnType> {
        let trampoline = (*self.original_fn.lock()).filter(|&address| address != 0)?;

        // `install` checked that `FnType` is pointer-sized.
        Some(unsafe { std::mem::transmute_copy(&trampoline) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHookInstaller;

    extern "C" fn replacement() {}

    #[test]
    fn install_and_remove() {
        let installer = MockHookInstaller::default();
        let hook = Hook::<extern "C" fn()>::new(0x6C3A30);

        hook.install(&installer, replacement).unwrap();
        assert!(hook.is_installed());
        assert!(hook.original().is_some());
        assert!(installer.is_hooked(0x6C3A30));

        hook.remove(&installer).unwrap();
        assert!(!hook.is_installed());
        assert!(!installer.is_hooked(0x6C3A30));

        assert!(matches!(
            hook.remove(&installer),
            Err(HookError::NotInstalled(0x6C3A30))
        ));
    }

    #[test]
    fn failed_install_leaves_nothing_behind() {
        let installer = MockHookInstaller::default();
        installer.fail_on(0x1234);

        let hook = Hook::<extern "C" fn()>::new(0x1234);
        assert!(hook.install(&installer, replacement).is_err());
        assert!(!hook.is_installed());
        assert!(hook.original().is_none());
    }

    #[test]
    fn non_pointer_replacements_are_rejected() {
        let installer = MockHookInstaller::default();
        let hook = Hook::<(usize, usize)>::new(0x10);

        assert!(matches!(
            hook.install(&installer, (1, 2)),
            Err(HookError::BadSignature(0x10))
        ));
    }
}

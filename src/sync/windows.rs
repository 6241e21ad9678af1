//! Win32 backend: SRW locks, condition variables and thread handles.

use std::{cell::UnsafeCell, ptr::null_mut, time::Duration};

use winapi::{
    shared::{
        minwindef::{DWORD, LPVOID},
        winerror::ERROR_TIMEOUT,
    },
    um::{
        errhandlingapi::GetLastError,
        handleapi::CloseHandle,
        processthreadsapi::CreateThread,
        synchapi::{
            AcquireSRWLockExclusive, InitializeConditionVariable, InitializeSRWLock,
            ReleaseSRWLockExclusive, SleepConditionVariableSRW, TryAcquireSRWLockExclusive,
            WakeAllConditionVariable, WakeConditionVariable, WaitForSingleObject,
        },
        winbase::{INFINITE, STACK_SIZE_PARAM_IS_A_RESERVATION, WAIT_FAILED},
        winnt::{HANDLE, RTL_CONDITION_VARIABLE, RTL_SRWLOCK},
    },
};

use super::{RawCondvar, RawMutex, ThreadSystem};
use crate::runtime::error::{Error, Result};

pub struct Windows;

pub struct WinMutex {
    inner: Box<UnsafeCell<RTL_SRWLOCK>>,
}

unsafe impl Send for WinMutex {}
unsafe impl Sync for WinMutex {}

unsafe impl RawMutex for WinMutex {
    fn create() -> Result<Self> {
        let inner: Box<UnsafeCell<RTL_SRWLOCK>> = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        unsafe { InitializeSRWLock(inner.get()) };
        Ok(Self { inner })
    }

    fn lock(&self) {
        unsafe { AcquireSRWLockExclusive(self.inner.get()) }
    }

    fn try_lock(&self) -> bool {
        unsafe { TryAcquireSRWLockExclusive(self.inner.get()) != 0 }
    }

    unsafe fn unlock(&self) {
        ReleaseSRWLockExclusive(self.inner.get())
    }
}

pub struct WinCondvar {
    inner: Box<UnsafeCell<RTL_CONDITION_VARIABLE>>,
}

unsafe impl Send for WinCondvar {}
unsafe impl Sync for WinCondvar {}

fn timeout_millis(timeout: Duration) -> DWORD {
    let millis = timeout
        .as_millis()
        .saturating_add((timeout.subsec_nanos() % 1_000_000 != 0) as u128);
    millis.min((INFINITE - 1) as u128) as DWORD
}

unsafe impl RawCondvar for WinCondvar {
    type Mutex = WinMutex;

    fn create() -> Result<Self> {
        let inner: Box<UnsafeCell<RTL_CONDITION_VARIABLE>> =
            Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        unsafe { InitializeConditionVariable(inner.get()) };
        Ok(Self { inner })
    }

    unsafe fn wait(&self, mutex: &WinMutex) {
        SleepConditionVariableSRW(self.inner.get(), mutex.inner.get(), INFINITE, 0);
    }

    unsafe fn wait_timeout(&self, mutex: &WinMutex, timeout: Duration) -> bool {
        let ok = SleepConditionVariableSRW(
            self.inner.get(),
            mutex.inner.get(),
            timeout_millis(timeout),
            0,
        );
        ok == 0 && GetLastError() == ERROR_TIMEOUT
    }

    fn signal(&self) {
        unsafe { WakeConditionVariable(self.inner.get()) }
    }

    fn broadcast(&self) {
        unsafe { WakeAllConditionVariable(self.inner.get()) }
    }
}

pub struct WinThread {
    handle: HANDLE,
}

unsafe impl Send for WinThread {}

impl Drop for WinThread {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

unsafe extern "system" fn thread_start(main: LPVOID) -> DWORD {
    let main = Box::from_raw(main as *mut Box<dyn FnOnce() + Send>);
    main();
    0
}

impl ThreadSystem for Windows {
    type Mutex = WinMutex;
    type Condvar = WinCondvar;
    type Handle = WinThread;

    const NAME: &'static str = "windows";

    fn spawn(stack_size: Option<usize>, main: Box<dyn FnOnce() + Send>) -> Result<WinThread> {
        let main = Box::into_raw(Box::new(main));
        let handle = unsafe {
            CreateThread(
                null_mut(),
                stack_size.unwrap_or(0),
                Some(thread_start),
                main.cast(),
                STACK_SIZE_PARAM_IS_A_RESERVATION,
                null_mut(),
            )
        };
        if handle.is_null() {
            unsafe { drop(Box::from_raw(main)) };
            return Err(Error::ThreadSpawn(std::io::Error::last_os_error()));
        }
        Ok(WinThread { handle })
    }

    fn join(handle: WinThread) -> Result<()> {
        if unsafe { WaitForSingleObject(handle.handle, INFINITE) } == WAIT_FAILED {
            return Err(Error::ThreadJoin(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn detach(handle: WinThread) {
        drop(handle);
    }
}

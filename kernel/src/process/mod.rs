//! App management: the table of running user applications.
//!
//! An app owns a main thread, a working directory and its standard stream
//! targets. Loading an app image is delegated to a registered loader (the
//! system loader lives outside this tree); the table tracks lifecycle,
//! exit codes and join waiters.

use crate::fs::vfs::path::Path;
use crate::task::scheduler;
use crate::task::thread::ThreadState;
use crate::util::handle::HandleTable;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

/// One running (or exited, not yet joined) application.
pub struct App {
    pub handle: u16,
    pub name: String,
    pub working_directory: Path,
    /// Handle of the app's main thread.
    pub main_thread: u16,
    /// Exit code once the app exited.
    pub exit_code: Option<i32>,
    /// Threads blocked in `app_join` on this app.
    join_waiters: Vec<u16>,
    pub stdin_target: u16,
    pub stdout_target: u16,
    pub stderr_target: u16,
}

/// Errors of app operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppError {
    UnknownApp,
    LoaderMissing,
    LoadFailed,
}

/// Loader hook: builds the address space and main thread for an app image
/// and returns the main thread handle.
pub type AppLoader = fn(app: u16, image_path: &Path, argv: &[String]) -> Option<u16>;

static APPS: Mutex<HandleTable<App>> = Mutex::new(HandleTable::new());
static LOADER: Mutex<Option<AppLoader>> = Mutex::new(None);

/// Install the system loader. Called once during boot.
pub fn set_app_loader(loader: AppLoader) {
    *LOADER.lock() = Some(loader);
}

/// Start an app from `image_path`, with `argv` and the given working
/// directory and stream targets. Returns the new app handle.
pub fn start_app(
    image_path: &Path,
    argv: &[String],
    working_directory: Path,
    stdin_target: u16,
    stdout_target: u16,
    stderr_target: u16,
) -> Result<u16, AppError> {
    let loader = LOADER.lock().ok_or(AppError::LoaderMissing)?;

    scheduler::lock();
    let handle = APPS.lock().insert_with(|handle| App {
        handle,
        name: String::from(image_path.file_name()),
        working_directory,
        main_thread: 0,
        exit_code: None,
        join_waiters: Vec::new(),
        stdin_target,
        stdout_target,
        stderr_target,
    });
    scheduler::unlock();
    let Some(handle) = handle else {
        return Err(AppError::LoadFailed);
    };

    match loader(handle, image_path, argv) {
        Some(thread) => {
            scheduler::lock();
            if let Some(app) = APPS.lock().get_mut(handle) {
                app.main_thread = thread;
            }
            scheduler::with_scheduler(|s| {
                if let Some(t) = s.thread_mut(thread) {
                    t.app_handle = handle;
                }
            });
            scheduler::unlock();
            log::info!("app: \"{}\" started as app {}", image_path, handle);
            Ok(handle)
        }
        None => {
            scheduler::lock();
            APPS.lock().remove(handle);
            scheduler::unlock();
            log::warn!("app: loading \"{}\" failed", image_path);
            Err(AppError::LoadFailed)
        }
    }
}

/// The app the running thread belongs to (0 for kernel threads).
pub fn current_app_handle() -> u16 {
    scheduler::with_scheduler(|s| {
        let running = s.running_thread();
        s.thread(running).map(|t| t.app_handle).unwrap_or(0)
    })
    .unwrap_or(0)
}

/// Run `f` on the app `handle`.
pub fn with_app<R>(handle: u16, f: impl FnOnce(&mut App) -> R) -> Option<R> {
    scheduler::lock();
    let result = APPS.lock().get_mut(handle).map(f);
    scheduler::unlock();
    result
}

/// Working directory of the running thread's app; the root for kernel
/// threads.
pub fn current_working_directory() -> Path {
    let app = current_app_handle();
    if app == 0 {
        return Path::root();
    }
    with_app(app, |a| a.working_directory.clone()).unwrap_or_else(Path::root)
}

/// Change the working directory of the running thread's app.
pub fn change_working_directory(path: Path) -> bool {
    let app = current_app_handle();
    if app == 0 {
        return false;
    }
    with_app(app, |a| a.working_directory = path).is_some()
}

/// Record an app exit and wake its joiners. Called by the scheduler when a
/// thread exits; only an app's main thread ends the app.
pub fn notify_thread_exited(thread: u16, code: i32) {
    if thread == 0 {
        return;
    }
    let mut waiters = Vec::new();
    {
        let mut apps = APPS.lock();
        for (_, app) in apps.iter_mut() {
            if app.main_thread == thread && app.exit_code.is_none() {
                app.exit_code = Some(code);
                waiters = core::mem::take(&mut app.join_waiters);
                log::trace!("app: {} exited with code {}", app.handle, code);
                break;
            }
        }
    }
    if !waiters.is_empty() {
        scheduler::with_scheduler(|s| {
            for waiter in waiters {
                s.schedule(waiter);
            }
        });
    }
}

/// Outcome of a join: the app's exit code once it exited.
pub fn join_app(app_handle: u16) -> Result<i32, AppError> {
    loop {
        scheduler::lock();
        let state = {
            let mut apps = APPS.lock();
            match apps.get_mut(app_handle) {
                None => Some(Err(AppError::UnknownApp)),
                Some(app) => match app.exit_code {
                    Some(code) => Some(Ok(code)),
                    None => {
                        // Park the calling thread until the app exits.
                        let current = scheduler::current_thread_handle();
                        app.join_waiters.push(current);
                        None
                    }
                },
            }
        };
        match state {
            Some(result) => {
                if result.is_ok() {
                    // The record is consumed by the first successful join.
                    APPS.lock().remove(app_handle);
                }
                scheduler::unlock();
                return result;
            }
            None => {
                scheduler::with_scheduler(|s| {
                    let current = s.running_thread();
                    if let Some(t) = s.thread_mut(current) {
                        t.state = ThreadState::Waiting;
                        t.join_app_id = app_handle;
                    }
                });
                scheduler::execute_next_thread();
                scheduler::unlock();
                // Woken: the exit code is available on the next pass.
            }
        }
    }
}

/// Terminate the running thread and record its app's exit code. Never
/// returns.
pub fn exit_app(code: i32) -> ! {
    scheduler::thread_exit(code)
}

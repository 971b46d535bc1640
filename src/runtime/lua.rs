// src/runtime/lua.rs
//! Lua 5.4 backend
//!
//! Each [`LuaInterpreter`] owns one `lua_State` created with `lua_newstate`
//! and an allocation callback monomorphized for the allocator chosen by the
//! pool, so the quota check costs nothing when no quota is configured.
//!
//! Stack layout of an idle state:
//!
//! ```text
//! [1] traceback message handler
//! ```
//!
//! Every call pushes the loaded chunk above it and restores the stack height
//! afterwards, whatever the outcome.

use crate::runtime::allocator::Allocator;
use crate::runtime::interpreter::{CallFailure, FailureKind, InitOptions, Interpreter, SearchPath};
use crate::utils::errors::{PoolError, Result};
use mlua_sys as ffi;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;
use std::ptr::{self, NonNull};

/// Stack slot of the message handler passed to every protected call
const TRACEBACK_INDEX: c_int = 1;

/// A unit of work: a named Lua chunk
///
/// The chunk's first return value is the result code; anything that is not
/// an integer counts as 0.
#[derive(Debug, Clone)]
pub struct Chunk {
    name: CString,
    source: Vec<u8>,
}

impl Chunk {
    pub fn new(name: &str, source: impl Into<Vec<u8>>) -> Result<Self> {
        let name = CString::new(name)
            .map_err(|_| PoolError::InvalidChunk(format!("chunk name {:?} contains a NUL byte", name)))?;
        Ok(Self {
            name,
            source: source.into(),
        })
    }

    /// Load a chunk from a file, named `@<path>` as the standalone
    /// interpreter does
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read(path)?;
        Self::new(&format!("@{}", path.display()), source)
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("?")
    }
}

/// A Lua state whose allocations go through a pool-selected allocator
pub struct LuaInterpreter {
    state: NonNull<ffi::lua_State>,

    /// Must outlive `state`; released in `Drop` after `lua_close`
    allocator: NonNull<dyn Allocator>,
}

impl LuaInterpreter {
    /// Current `package.path`
    pub fn package_path(&self) -> Option<String> {
        self.package_field(c"path")
    }

    /// Current `package.cpath`
    pub fn package_cpath(&self) -> Option<String> {
        self.package_field(c"cpath")
    }

    fn package_field(&self, field: &CStr) -> Option<String> {
        let state = self.state.as_ptr();
        unsafe {
            let top = ffi::lua_gettop(state);
            let value = if ffi::lua_getglobal(state, c"package".as_ptr()) == ffi::LUA_TTABLE
                && ffi::lua_getfield(state, -1, field.as_ptr()) == ffi::LUA_TSTRING
            {
                Some(string_at(state, -1))
            } else {
                None
            };
            ffi::lua_settop(state, top);
            value
        }
    }

    fn bootstrap(&mut self, options: &InitOptions<'_>) -> Result<()> {
        let state = self.state.as_ptr();
        unsafe {
            // Neither push allocates, so nothing can fail outside the
            // protected call
            ffi::lua_pushcfunction(state, init_state);
            ffi::lua_pushlightuserdata(state, options as *const InitOptions<'_> as *mut c_void);
            if ffi::lua_pcall(state, 1, 0, 0) != ffi::LUA_OK {
                let message = message_at(state, -1);
                ffi::lua_settop(state, 0);
                return Err(PoolError::InitializationFailed(message));
            }
            ffi::lua_pushcfunction(state, traceback);
        }
        Ok(())
    }

    #[cfg(test)]
    fn stack_height(&self) -> c_int {
        unsafe { ffi::lua_gettop(self.state.as_ptr()) }
    }
}

impl Interpreter for LuaInterpreter {
    type Work = Chunk;

    fn create<A: Allocator + 'static>(allocator: A, options: &InitOptions<'_>) -> Result<Self> {
        let raw: *mut A = Box::into_raw(Box::new(allocator));
        let state = unsafe { ffi::lua_newstate(allocate::<A>, raw as *mut c_void) };
        let Some(state) = NonNull::new(state) else {
            drop(unsafe { Box::from_raw(raw) });
            return Err(PoolError::OutOfMemory);
        };

        let erased: *mut dyn Allocator = raw;
        let mut interpreter = Self {
            state,
            allocator: unsafe { NonNull::new_unchecked(erased) },
        };
        interpreter.bootstrap(options)?;
        Ok(interpreter)
    }

    fn call(&mut self, chunk: &Chunk) -> std::result::Result<i64, CallFailure> {
        let state = self.state.as_ptr();
        unsafe {
            let top = ffi::lua_gettop(state);
            let mut status = ffi::luaL_loadbufferx(
                state,
                chunk.source.as_ptr() as *const c_char,
                chunk.source.len(),
                chunk.name.as_ptr(),
                ptr::null(),
            );
            if status == ffi::LUA_OK {
                status = ffi::lua_pcall(state, 0, 1, TRACEBACK_INDEX);
            }

            let result = if status == ffi::LUA_OK {
                Ok(ffi::lua_tointegerx(state, -1, ptr::null_mut()))
            } else {
                Err(CallFailure {
                    kind: failure_kind(status),
                    message: message_at(state, -1),
                })
            };

            ffi::lua_settop(state, top);
            result
        }
    }

    fn allocated(&self) -> Option<usize> {
        unsafe { self.allocator.as_ref().used() }
    }

    fn memory_usage(&self) -> usize {
        let state = self.state.as_ptr();
        unsafe {
            let kbytes = ffi::lua_gc(state, ffi::LUA_GCCOUNT, 0) as usize;
            let remainder = ffi::lua_gc(state, ffi::LUA_GCCOUNTB, 0) as usize;
            kbytes * 1024 + remainder
        }
    }

    fn collect(&mut self) {
        unsafe {
            ffi::lua_gc(self.state.as_ptr(), ffi::LUA_GCCOLLECT, 0);
        }
    }
}

impl Drop for LuaInterpreter {
    fn drop(&mut self) {
        unsafe {
            ffi::lua_close(self.state.as_ptr());
            drop(Box::from_raw(self.allocator.as_ptr()));
        }
    }
}

/// `lua_Alloc` callback over allocator `A`
unsafe extern "C-unwind" fn allocate<A: Allocator>(
    ud: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    let allocator = &*(ud as *const A);
    // For a fresh block Lua passes the object type in osize
    let old_size = if ptr.is_null() { 0 } else { osize };
    match allocator.realloc(ptr as *mut u8, old_size, nsize) {
        Ok(Some(block)) => block.as_ptr() as *mut c_void,
        Ok(None) | Err(_) => ptr::null_mut(),
    }
}

/// Protected bootstrap: standard libraries, then search paths
unsafe extern "C-unwind" fn init_state(state: *mut ffi::lua_State) -> c_int {
    let options = &*(ffi::lua_touserdata(state, 1) as *const InitOptions);
    ffi::luaL_openlibs(state);
    set_search_path(state, options.path, c"path");
    set_search_path(state, options.cpath, c"cpath");
    0
}

unsafe fn set_search_path(state: *mut ffi::lua_State, path: SearchPath<'_>, field: &CStr) {
    if path == SearchPath::Default {
        return;
    }
    if ffi::lua_getglobal(state, c"package".as_ptr()) != ffi::LUA_TTABLE {
        ffi::luaL_error(state, c"failed to get package table".as_ptr());
    }

    match path {
        SearchPath::Append(suffix) => {
            if ffi::lua_getfield(state, -1, field.as_ptr()) != ffi::LUA_TSTRING {
                ffi::luaL_error(state, c"failed to get package.%s".as_ptr(), field.as_ptr());
            }
            ffi::lua_pushlstring(state, c";".as_ptr(), 1);
            ffi::lua_pushlstring(state, suffix.as_ptr() as *const c_char, suffix.len());
            ffi::lua_concat(state, 3);
        }
        SearchPath::Replace(value) => {
            ffi::lua_pushlstring(state, value.as_ptr() as *const c_char, value.len());
        }
        SearchPath::Default => {}
    }

    ffi::lua_setfield(state, -2, field.as_ptr());
    ffi::lua_pop(state, 1);
}

/// Message handler: error message plus stack traceback
unsafe extern "C-unwind" fn traceback(state: *mut ffi::lua_State) -> c_int {
    let message = if ffi::lua_type(state, 1) == ffi::LUA_TSTRING {
        ffi::lua_tolstring(state, 1, ptr::null_mut())
    } else {
        ffi::luaL_tolstring(state, 1, ptr::null_mut())
    };
    ffi::luaL_traceback(state, state, message, 1);
    1
}

fn failure_kind(status: c_int) -> FailureKind {
    match status {
        ffi::LUA_ERRMEM => FailureKind::OutOfMemory,
        ffi::LUA_ERRSYNTAX => FailureKind::Syntax,
        ffi::LUA_ERRERR => FailureKind::Handler,
        _ => FailureKind::Runtime,
    }
}

unsafe fn message_at(state: *mut ffi::lua_State, index: c_int) -> String {
    if ffi::lua_type(state, index) != ffi::LUA_TSTRING {
        return "(error object is not a string)".to_string();
    }
    string_at(state, index)
}

/// Copy the string at `index`; the caller has checked its type
unsafe fn string_at(state: *mut ffi::lua_State, index: c_int) -> String {
    let mut len = 0usize;
    let data = ffi::lua_tolstring(state, index, &mut len);
    if data.is_null() {
        return String::new();
    }
    String::from_utf8_lossy(std::slice::from_raw_parts(data as *const u8, len)).into_owned()
}

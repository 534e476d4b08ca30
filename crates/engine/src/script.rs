//! Embedded Lua evaluation context.
//!
//! One [`ScriptContext`] lives for the whole workflow run. Compiled chunks are
//! cached by their trimmed source text (or by content hash for plugin entry
//! files), so repeated evaluations of the same expression compile once.
//!
//! Every chunk is compiled against a shared sandbox table used as its `_ENV`.
//! Before each call the sandbox is pointed at a fresh bindings table carrying
//! the `env` helper, `print`, the template variables and any engine bindings;
//! lookups fall back to a base table holding the safe builtins and read-only
//! views of the `string`, `table`, `math` and `utf8` libraries. `_G` and the
//! raw table setters are not exposed. Assignments made by a script land in the
//! per-call bindings table and do not leak into later evaluations.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mlua::{Function, Lua, LuaOptions, LuaSerdeExt, StdLib, Table, Value as LuaValue, Variadic};
use sha2::{Digest, Sha256};
use stepline_util::{Env, SharedEnv};
use thiserror::Error;
use tracing::{debug, info};

/// Template variables exposed to scripts as globals (`args`, `job`, ...).
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Names owned by the engine; variables may not shadow them.
pub const RESERVED_BINDINGS: &[&str] = &["env", "print", "config", "plugin", "file", "process"];

const SCRIPT_LOG_TARGET: &str = "stepline::script";

const SAFE_BUILTINS: &[&str] = &[
    "_VERSION",
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "rawequal",
    "rawget",
    "rawlen",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
];

const LIBRARIES: &[&str] = &["string", "table", "math", "utf8"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("compile error: {0}")]
    Compile(String),
    /// Lua's own message, which already names the error kind.
    #[error("{0}")]
    Runtime(String),
    #[error("'{0}' is a reserved engine binding and cannot be used as a variable name")]
    ReservedBinding(String),
    #[error("script '{0}' has not been compiled")]
    NotCompiled(String),
    #[error("no output")]
    NoOutput,
    #[error("invalid output: cannot convert a {0} value")]
    InvalidOutput(String),
    #[error("failed to read script {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("script engine error: {0}")]
    Engine(String),
}

impl ScriptError {
    /// Return code reported by a step whose script failed.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl From<mlua::Error> for ScriptError {
    fn from(error: mlua::Error) -> Self {
        ScriptError::Engine(error.to_string())
    }
}

pub struct ScriptContext {
    lua: Lua,
    base: Table,
    sandbox: Table,
    cache: HashMap<String, Result<Function, String>>,
}

impl ScriptContext {
    /// Create a context with the string, table, math and utf8 libraries only.
    pub fn new() -> Result<Self, ScriptError> {
        let lua = Lua::new_with(StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8, LuaOptions::default())?;
        let base = sandbox_base(&lua)?;
        let sandbox = lua.create_table()?;
        Ok(Self {
            lua,
            base,
            sandbox,
            cache: HashMap::new(),
        })
    }

    /// Compile `source` and cache the outcome, failures included.
    pub fn compile(&mut self, source: &str) -> Result<(), ScriptError> {
        let source = source.trim();
        self.compile_keyed(source.to_string(), source, "inline").map(|_| ())
    }

    /// Compile a script file. Returns the cache key to pass to
    /// [`ScriptContext::run_compiled`].
    pub fn compile_file(&mut self, path: &Path) -> Result<String, ScriptError> {
        let source = fs::read_to_string(path).map_err(|error| ScriptError::Read {
            path: path.to_path_buf(),
            message: error.to_string(),
        })?;
        let key = content_key(&source);
        let chunk_name = path.display().to_string();
        self.compile_keyed(key.clone(), &source, &chunk_name)?;
        Ok(key)
    }

    pub fn is_cached(&self, source: &str) -> bool {
        self.cache.contains_key(source.trim())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Evaluate `script` and stringify its value; `nil` yields an empty string.
    pub fn run(&mut self, env: &SharedEnv, script: &str, variables: &Variables) -> Result<String, ScriptError> {
        let value = self.evaluate(env, script, variables)?;
        Ok(display_value(&value))
    }

    /// Run a previously compiled chunk with extra engine bindings such as
    /// `config` and `plugin`.
    pub fn run_compiled(
        &mut self,
        env: &SharedEnv,
        key: &str,
        variables: &Variables,
        engine_bindings: &Variables,
    ) -> Result<String, ScriptError> {
        check_reserved(variables)?;
        let function = match self.cache.get(key) {
            Some(Ok(function)) => function.clone(),
            Some(Err(message)) => return Err(ScriptError::Compile(message.clone())),
            None => return Err(ScriptError::NotCompiled(key.to_string())),
        };
        let value = self.call(&function, env, variables, engine_bindings)?;
        Ok(display_value(&value))
    }

    /// Evaluate `expression` as a boolean.
    ///
    /// Numbers are true when non-zero and strings must read `true` or `false`.
    pub fn eval_bool(&mut self, env: &SharedEnv, expression: &str, variables: &Variables) -> Result<bool, ScriptError> {
        let value = self.evaluate(env, expression, variables)?;
        if is_missing(&value) {
            return Err(ScriptError::NoOutput);
        }
        match value {
            LuaValue::Boolean(flag) => Ok(flag),
            LuaValue::Integer(number) => Ok(number != 0),
            LuaValue::Number(number) => Ok(number != 0.0),
            LuaValue::String(text) => match text.to_string_lossy().trim().to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(ScriptError::InvalidOutput("string".to_string())),
            },
            other => Err(ScriptError::InvalidOutput(other.type_name().to_string())),
        }
    }

    /// Evaluate `expression` as a string. Tables are JSON-encoded.
    pub fn eval_str(&mut self, env: &SharedEnv, expression: &str, variables: &Variables) -> Result<String, ScriptError> {
        let value = self.evaluate(env, expression, variables)?;
        if is_missing(&value) {
            return Err(ScriptError::NoOutput);
        }
        match &value {
            LuaValue::String(_) | LuaValue::Boolean(_) | LuaValue::Integer(_) | LuaValue::Number(_) => {
                Ok(display_value(&value))
            }
            LuaValue::Table(_) => {
                serde_json::to_string(&value).map_err(|_| ScriptError::InvalidOutput("table".to_string()))
            }
            other => Err(ScriptError::InvalidOutput(other.type_name().to_string())),
        }
    }

    fn evaluate(&mut self, env: &SharedEnv, script: &str, variables: &Variables) -> Result<LuaValue, ScriptError> {
        check_reserved(variables)?;
        let source = script.trim();
        let function = self.compile_keyed(source.to_string(), source, "inline")?;
        self.call(&function, env, variables, &Variables::new())
    }

    fn compile_keyed(&mut self, key: String, source: &str, chunk_name: &str) -> Result<Function, ScriptError> {
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone().map_err(ScriptError::Compile);
        }
        let compiled = self.compile_source(source, chunk_name);
        match &compiled {
            Ok(_) => debug!(chunk = chunk_name, "compiled script"),
            Err(message) => debug!(chunk = chunk_name, error = %message, "script failed to compile"),
        }
        self.cache.insert(key, compiled.clone());
        compiled.map_err(ScriptError::Compile)
    }

    // Expressions compile as `return <source>`; anything else is a block.
    fn compile_source(&self, source: &str, chunk_name: &str) -> Result<Function, String> {
        let expression = format!("return {source}");
        let as_expression = self
            .lua
            .load(expression.as_str())
            .set_name(format!("={chunk_name}"))
            .set_environment(self.sandbox.clone())
            .into_function();
        if let Ok(function) = as_expression {
            return Ok(function);
        }
        self.lua
            .load(source)
            .set_name(format!("={chunk_name}"))
            .set_environment(self.sandbox.clone())
            .into_function()
            .map_err(|error| error.to_string())
    }

    fn call(
        &self,
        function: &Function,
        env: &SharedEnv,
        variables: &Variables,
        engine_bindings: &Variables,
    ) -> Result<LuaValue, ScriptError> {
        let bindings = self.bindings(env, variables, engine_bindings)?;
        let proxy = self.lua.create_table()?;
        proxy.set("__index", bindings.clone())?;
        proxy.set("__newindex", bindings)?;
        self.sandbox.set_metatable(Some(proxy));
        let result = function.call::<LuaValue>(());
        self.sandbox.set_metatable(None);
        result.map_err(|error| ScriptError::Runtime(error.to_string()))
    }

    fn bindings(&self, env: &SharedEnv, variables: &Variables, engine_bindings: &Variables) -> Result<Table, ScriptError> {
        let lua = &self.lua;
        let bindings = lua.create_table()?;
        let fallback = lua.create_table()?;
        fallback.set("__index", self.base.clone())?;
        bindings.set_metatable(Some(fallback));

        bindings.set("env", self.env_table(env)?)?;
        bindings.set(
            "print",
            lua.create_function(|_, values: Variadic<LuaValue>| {
                let line = values.iter().map(display_value).collect::<Vec<_>>().join("\t");
                info!(target: SCRIPT_LOG_TARGET, "{line}");
                Ok(())
            })?,
        )?;
        for (name, value) in variables.iter().chain(engine_bindings.iter()) {
            bindings.set(name.as_str(), lua.to_value(value)?)?;
        }
        Ok(bindings)
    }

    fn env_table(&self, env: &SharedEnv) -> Result<Table, ScriptError> {
        let lua = &self.lua;
        let table = lua.create_table()?;

        let scope = Arc::clone(env);
        table.set("get", lua.create_function(move |_, key: String| Ok(scope.get(&key)))?)?;
        let scope = Arc::clone(env);
        table.set(
            "set",
            lua.create_function(move |_, (key, value): (String, String)| {
                scope.set(&key, &value).map_err(mlua::Error::external)
            })?,
        )?;
        let scope = Arc::clone(env);
        table.set("expand", lua.create_function(move |_, input: String| Ok(scope.expand(&input)))?)?;
        let scope = Arc::clone(env);
        table.set("contains", lua.create_function(move |_, key: String| Ok(scope.contains(&key)))?)?;
        let scope = Arc::clone(env);
        table.set("all", lua.create_function(move |lua, ()| lua.create_table_from(scope.get_all()))?)?;
        Ok(table)
    }
}

fn sandbox_base(lua: &Lua) -> Result<Table, ScriptError> {
    let globals = lua.globals();
    let base = lua.create_table()?;
    for name in SAFE_BUILTINS {
        base.set(*name, globals.get::<LuaValue>(*name)?)?;
    }
    let next: Function = globals.get("next")?;
    for name in LIBRARIES {
        let library: Table = globals.get(*name)?;
        base.set(*name, read_only(lua, library, next.clone())?)?;
    }
    Ok(base)
}

// Empty proxy reading through to `library`; writes raise an error.
fn read_only(lua: &Lua, library: Table, next: Function) -> Result<Table, ScriptError> {
    let meta = lua.create_table()?;
    meta.set("__index", library.clone())?;
    meta.set(
        "__newindex",
        lua.create_function(|_, _: Variadic<LuaValue>| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError("attempt to modify a read-only library".to_string()))
        })?,
    )?;
    meta.set(
        "__pairs",
        lua.create_function(move |_, _: LuaValue| Ok((next.clone(), library.clone(), LuaValue::Nil)))?,
    )?;
    meta.set("__metatable", false)?;
    let proxy = lua.create_table()?;
    proxy.set_metatable(Some(meta));
    Ok(proxy)
}

fn check_reserved(variables: &Variables) -> Result<(), ScriptError> {
    match variables.keys().find(|name| RESERVED_BINDINGS.contains(&name.as_str())) {
        Some(name) => Err(ScriptError::ReservedBinding(name.clone())),
        None => Ok(()),
    }
}

fn content_key(source: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(source.as_bytes())))
}

fn is_missing(value: &LuaValue) -> bool {
    matches!(value, LuaValue::Nil) || *value == LuaValue::NULL
}

fn display_value(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => String::new(),
        LuaValue::Boolean(flag) => flag.to_string(),
        LuaValue::Integer(number) => number.to_string(),
        LuaValue::Number(number) => format_number(*number),
        LuaValue::String(text) => text.to_string_lossy().to_string(),
        LuaValue::Table(_) => serde_json::to_string(value).unwrap_or_else(|_| "table".to_string()),
        other => other.type_name().to_string(),
    }
}

fn format_number(number: f64) -> String {
    if number.is_finite() && number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        number.to_string()
    }
}

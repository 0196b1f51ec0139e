//! In-isolate harness
//!
//! The harness is a static Python script copied into every scratch directory.
//! It reads `run.json`, mounts the `servers` and `skills` packages, binds the
//! per-isolate capability context, executes the source and writes
//! `result.json` with `os.replace` so a partial report is never read.
//!
//! Standard output and error of the executed code go straight to the
//! isolate's own stdout/stderr pipes; the host captures them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) const HARNESS_FILE: &str = "harness.py";
pub(crate) const SPEC_FILE: &str = "run.json";
pub(crate) const REPORT_FILE: &str = "result.json";
pub(crate) const BRIDGE_SOCKET: &str = "bridge.sock";

pub(crate) const HARNESS_PY: &str = r#"import builtins
import json
import os
import socket
import sys
import traceback
import types

_RESULT_NAMES = ("result", "output", "answer", "data")
_FILENAME = "<agent_code>"


class IsolateContext:
    """Capability access for one isolate. Each call is a blocking round trip
    over the host bridge socket."""

    def __init__(self, socket_path, inputs):
        self._socket_path = socket_path
        self._next_id = 0
        self.inputs = inputs

    def mcp_call(self, server, tool, params=None, **kwargs):
        if not self._socket_path:
            raise RuntimeError("no capability bridge attached to this isolate")
        args = dict(params or {})
        args.update(kwargs)
        self._next_id += 1
        request = {"id": self._next_id, "server": server, "tool": tool, "params": args}
        payload = (json.dumps(request, default=str) + "\n").encode("utf-8")
        with socket.socket(socket.AF_UNIX, socket.SOCK_STREAM) as sock:
            sock.connect(self._socket_path)
            sock.sendall(payload)
            with sock.makefile("r", encoding="utf-8") as reader:
                line = reader.readline()
        if not line:
            raise RuntimeError("capability bridge closed the connection")
        reply = json.loads(line)
        if not reply.get("ok"):
            raise RuntimeError("%s.%s failed: %s" % (server, tool, reply.get("error")))
        return reply.get("result")


def _mount(name, path):
    module = types.ModuleType(name)
    module.__path__ = [path] if path and os.path.isdir(path) else []
    module.__package__ = name
    sys.modules[name] = module


def _apply_limits(spec):
    try:
        import resource
    except ImportError:
        return
    memory = spec.get("memory_bytes")
    if memory:
        resource.setrlimit(resource.RLIMIT_AS, (memory, memory))
    cpu = spec.get("cpu_seconds")
    if cpu:
        resource.setrlimit(resource.RLIMIT_CPU, (cpu, cpu + 1))
    nice = spec.get("nice") or 0
    if nice > 0:
        try:
            os.nice(nice)
        except OSError:
            pass


def _jsonable(value):
    try:
        return json.loads(json.dumps(value, default=str, allow_nan=False))
    except (TypeError, ValueError):
        return str(value)


def _error_line(exc):
    line = None
    tb = exc.__traceback__
    while tb is not None:
        if tb.tb_frame.f_code.co_filename == _FILENAME:
            line = tb.tb_lineno
        tb = tb.tb_next
    if line is None and isinstance(exc, SyntaxError) and exc.filename == _FILENAME:
        line = exc.lineno
    return line


def _describe(exc):
    return {
        "type": type(exc).__name__,
        "message": str(exc),
        "traceback": "".join(traceback.format_exception(type(exc), exc, exc.__traceback__)),
        "line": _error_line(exc),
    }


def _write_report(path, report):
    tmp = path + ".tmp"
    with open(tmp, "w", encoding="utf-8") as fh:
        json.dump(report, fh, default=str)
    os.replace(tmp, path)


def main():
    with open(sys.argv[1], "r", encoding="utf-8") as fh:
        spec = json.load(fh)

    _mount("servers", spec.get("api_root"))
    _mount("skills", spec.get("skills_root"))
    os.chdir(spec["scratch"])

    inputs = spec.get("inputs")
    context = IsolateContext(spec.get("bridge_socket"), inputs)
    runtime = types.ModuleType("skill_runtime")
    runtime.mcp_call = context.mcp_call
    runtime.context = context
    sys.modules["skill_runtime"] = runtime

    namespace = {
        "__name__": "__main__",
        "__builtins__": builtins,
        "mcp_call": context.mcp_call,
        "context": context,
        "__inputs__": inputs,
    }
    report = {"success": False, "return_value": None, "error": None}

    _apply_limits(spec)
    try:
        code = compile(spec["source"], _FILENAME, "exec")
        exec(code, namespace)
        entry = spec.get("entry_function")
        if entry:
            func = namespace.get(entry)
            if not callable(func):
                raise NameError("entry function %r is not defined" % entry)
            value = func(**inputs) if isinstance(inputs, dict) else func()
        elif "__result__" in namespace:
            value = namespace["__result__"]
        else:
            value = next((namespace[n] for n in _RESULT_NAMES if n in namespace), None)
        report["success"] = True
        report["return_value"] = _jsonable(value)
    except SystemExit as exc:
        if exc.code in (None, 0):
            report["success"] = True
        else:
            report["error"] = _describe(exc)
    except BaseException as exc:
        report["error"] = _describe(exc)
    finally:
        sys.stdout.flush()
        sys.stderr.flush()

    _write_report(spec["result_path"], report)


if __name__ == "__main__":
    main()
"#;

/// Contents of `run.json`. Paths are as seen from inside the isolate.
#[derive(Debug, Serialize)]
pub(crate) struct RunSpec<'a> {
    pub source: &'a str,
    pub api_root: String,
    pub skills_root: String,
    pub scratch: String,
    pub result_path: String,
    pub inputs: Option<&'a Value>,
    pub entry_function: Option<&'a str>,
    pub bridge_socket: Option<String>,
    pub memory_bytes: Option<u64>,
    pub cpu_seconds: Option<u64>,
    pub nice: i32,
}

/// Contents of `result.json`
#[derive(Debug, Deserialize)]
pub(crate) struct HarnessReport {
    pub success: bool,
    #[serde(default)]
    pub return_value: Value,
    #[serde(default)]
    pub error: Option<HarnessError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HarnessError {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub traceback: String,
    #[serde(default)]
    pub line: Option<u32>,
}

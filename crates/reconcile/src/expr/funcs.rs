//! Pure function library for expressions.
//!
//! Every function is side-effect-free and total over its accepted argument
//! shapes; anything else is an [`EvalError`]. Unknown arguments are handled
//! by the evaluator before dispatch, so functions here only ever see
//! concrete values (with one exception: `coalesce`, which the evaluator
//! calls through here unchanged because skipping unknowns is its job).

use crate::error::EvalError;
use crate::value::Value;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

/// Dispatch a function call on already-evaluated arguments.
pub fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "format" => format_fn(args),
        "join" => join(args),
        "split" => split(args),
        "lower" => lower(args),
        "upper" => upper(args),
        "trim" => trim(args),
        "length" => length(args),
        "element" => element(args),
        "concat" => concat(args),
        "contains" => contains(args),
        "lookup" => lookup(args),
        "keys" => keys(args),
        "values" => values(args),
        "coalesce" => coalesce(args),
        "base64encode" => base64encode(args),
        "base64decode" => base64decode(args),
        "cidrvalid" => cidrvalid(args),
        "cidrhost" => cidrhost(args),
        "cidrnetmask" => cidrnetmask(args),
        "cidrcontains" => cidrcontains(args),
        _ => Err(EvalError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

fn arity(name: &'static str, expected: &'static str, args: &[Value], ok: bool) -> Result<(), EvalError> {
    if ok {
        Ok(())
    } else {
        Err(EvalError::Arity {
            name,
            expected,
            actual: args.len(),
        })
    }
}

fn want_str<'a>(name: &'static str, value: &'a Value) -> Result<&'a str, EvalError> {
    value.as_str().ok_or_else(|| EvalError::Function {
        name,
        message: format!("expected a string, got {}", value.type_name()),
    })
}

fn want_list<'a>(name: &'static str, value: &'a Value) -> Result<&'a [Value], EvalError> {
    value.as_list().ok_or_else(|| EvalError::Function {
        name,
        message: format!("expected a list, got {}", value.type_name()),
    })
}

fn want_int(name: &'static str, value: &Value) -> Result<i64, EvalError> {
    value.as_int().ok_or_else(|| EvalError::Function {
        name,
        message: format!("expected an int, got {}", value.type_name()),
    })
}

/// `format(spec, args...)`: printf-style formatting supporting `%s`, `%d`,
/// `%f`, and `%%`.
fn format_fn(args: &[Value]) -> Result<Value, EvalError> {
    arity("format", "at least 1", args, !args.is_empty())?;
    let spec = want_str("format", &args[0])?;
    let mut out = String::new();
    let mut next = 1;
    let mut chars = spec.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let verb = chars.next().ok_or_else(|| EvalError::Function {
            name: "format",
            message: "dangling '%' at end of format string".to_string(),
        })?;
        if verb == '%' {
            out.push('%');
            continue;
        }
        let arg = args.get(next).ok_or_else(|| EvalError::Function {
            name: "format",
            message: format!("not enough arguments for format string (needed %{verb})"),
        })?;
        next += 1;
        match verb {
            's' => match arg {
                Value::String(s) => out.push_str(s),
                other => {
                    let _ = write!(out, "{other}");
                }
            },
            'd' => {
                let _ = write!(out, "{}", want_int("format", arg)?);
            }
            'f' => {
                let x = arg.as_float().ok_or_else(|| EvalError::Function {
                    name: "format",
                    message: format!("%f expects a number, got {}", arg.type_name()),
                })?;
                let _ = write!(out, "{x}");
            }
            other => {
                return Err(EvalError::Function {
                    name: "format",
                    message: format!("unsupported format verb %{other}"),
                });
            }
        }
    }

    if next < args.len() {
        return Err(EvalError::Function {
            name: "format",
            message: format!("{} unused argument(s)", args.len() - next),
        });
    }
    Ok(Value::String(out))
}

/// `join(sep, list)`: concatenate list elements with a separator.
fn join(args: &[Value]) -> Result<Value, EvalError> {
    arity("join", "2", args, args.len() == 2)?;
    let sep = want_str("join", &args[0])?;
    let items = want_list("join", &args[1])?;
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(s) => parts.push(s.clone()),
            other => parts.push(other.to_string()),
        }
    }
    Ok(Value::String(parts.join(sep)))
}

/// `split(sep, string)`: split into a list of strings.
fn split(args: &[Value]) -> Result<Value, EvalError> {
    arity("split", "2", args, args.len() == 2)?;
    let sep = want_str("split", &args[0])?;
    let text = want_str("split", &args[1])?;
    if sep.is_empty() {
        return Err(EvalError::Function {
            name: "split",
            message: "separator must not be empty".to_string(),
        });
    }
    Ok(Value::List(
        text.split(sep).map(|s| Value::from(s)).collect(),
    ))
}

fn lower(args: &[Value]) -> Result<Value, EvalError> {
    arity("lower", "1", args, args.len() == 1)?;
    Ok(Value::String(want_str("lower", &args[0])?.to_lowercase()))
}

fn upper(args: &[Value]) -> Result<Value, EvalError> {
    arity("upper", "1", args, args.len() == 1)?;
    Ok(Value::String(want_str("upper", &args[0])?.to_uppercase()))
}

fn trim(args: &[Value]) -> Result<Value, EvalError> {
    arity("trim", "1", args, args.len() == 1)?;
    Ok(Value::String(want_str("trim", &args[0])?.trim().to_string()))
}

/// `length(x)`: characters of a string, elements of a list, entries of a map.
fn length(args: &[Value]) -> Result<Value, EvalError> {
    arity("length", "1", args, args.len() == 1)?;
    let len = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Map(entries) => entries.len(),
        other => {
            return Err(EvalError::Function {
                name: "length",
                message: format!("expected string, list, or map, got {}", other.type_name()),
            });
        }
    };
    Ok(Value::Int(len as i64))
}

/// `element(list, index)`: index wrapping around the list length.
fn element(args: &[Value]) -> Result<Value, EvalError> {
    arity("element", "2", args, args.len() == 2)?;
    let items = want_list("element", &args[0])?;
    let index = want_int("element", &args[1])?;
    if items.is_empty() {
        return Err(EvalError::Function {
            name: "element",
            message: "cannot index into an empty list".to_string(),
        });
    }
    let wrapped = index.rem_euclid(items.len() as i64) as usize;
    Ok(items[wrapped].clone())
}

/// `concat(lists...)`: concatenate any number of lists.
fn concat(args: &[Value]) -> Result<Value, EvalError> {
    arity("concat", "at least 1", args, !args.is_empty())?;
    let mut out = Vec::new();
    for arg in args {
        out.extend_from_slice(want_list("concat", arg)?);
    }
    Ok(Value::List(out))
}

/// `contains(collection, needle)`: list membership or map key presence.
fn contains(args: &[Value]) -> Result<Value, EvalError> {
    arity("contains", "2", args, args.len() == 2)?;
    match &args[0] {
        Value::List(items) => Ok(Value::Bool(items.contains(&args[1]))),
        Value::Map(entries) => {
            let key = want_str("contains", &args[1])?;
            Ok(Value::Bool(entries.contains_key(key)))
        }
        Value::String(s) => {
            let needle = want_str("contains", &args[1])?;
            Ok(Value::Bool(s.contains(needle)))
        }
        other => Err(EvalError::Function {
            name: "contains",
            message: format!("expected list, map, or string, got {}", other.type_name()),
        }),
    }
}

/// `lookup(map, key)` or `lookup(map, key, default)`.
fn lookup(args: &[Value]) -> Result<Value, EvalError> {
    arity("lookup", "2 or 3", args, args.len() == 2 || args.len() == 3)?;
    let entries = args[0].as_map().ok_or_else(|| EvalError::Function {
        name: "lookup",
        message: format!("expected a map, got {}", args[0].type_name()),
    })?;
    let key = want_str("lookup", &args[1])?;
    match entries.get(key) {
        Some(value) => Ok(value.clone()),
        None => match args.get(2) {
            Some(default) => Ok(default.clone()),
            None => Err(EvalError::Function {
                name: "lookup",
                message: format!("map has no key {key:?} and no default was given"),
            }),
        },
    }
}

fn keys(args: &[Value]) -> Result<Value, EvalError> {
    arity("keys", "1", args, args.len() == 1)?;
    let entries = args[0].as_map().ok_or_else(|| EvalError::Function {
        name: "keys",
        message: format!("expected a map, got {}", args[0].type_name()),
    })?;
    Ok(Value::List(
        entries.keys().map(|k| Value::from(k.as_str())).collect(),
    ))
}

fn values(args: &[Value]) -> Result<Value, EvalError> {
    arity("values", "1", args, args.len() == 1)?;
    let entries = args[0].as_map().ok_or_else(|| EvalError::Function {
        name: "values",
        message: format!("expected a map, got {}", args[0].type_name()),
    })?;
    Ok(Value::List(entries.values().cloned().collect()))
}

/// `coalesce(args...)`: first argument that is neither null nor unknown.
fn coalesce(args: &[Value]) -> Result<Value, EvalError> {
    arity("coalesce", "at least 1", args, !args.is_empty())?;
    for arg in args {
        if !arg.is_null() && !arg.is_unknown() {
            return Ok(arg.clone());
        }
    }
    Err(EvalError::Function {
        name: "coalesce",
        message: "all arguments were null".to_string(),
    })
}

fn base64encode(args: &[Value]) -> Result<Value, EvalError> {
    arity("base64encode", "1", args, args.len() == 1)?;
    let text = want_str("base64encode", &args[0])?;
    Ok(Value::String(BASE64.encode(text.as_bytes())))
}

fn base64decode(args: &[Value]) -> Result<Value, EvalError> {
    arity("base64decode", "1", args, args.len() == 1)?;
    let text = want_str("base64decode", &args[0])?;
    let bytes = BASE64.decode(text).map_err(|e| EvalError::Function {
        name: "base64decode",
        message: format!("invalid base64: {e}"),
    })?;
    let decoded = String::from_utf8(bytes).map_err(|_| EvalError::Function {
        name: "base64decode",
        message: "decoded bytes are not valid UTF-8".to_string(),
    })?;
    Ok(Value::String(decoded))
}

/// Parsed `a.b.c.d/len` IPv4 prefix.
struct Cidr {
    network: u32,
    prefix_len: u8,
}

impl Cidr {
    fn parse(name: &'static str, text: &str) -> Result<Self, EvalError> {
        let bad = || EvalError::Function {
            name,
            message: format!("{text:?} is not a valid IPv4 CIDR prefix"),
        };
        let (addr, len) = text.split_once('/').ok_or_else(bad)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| bad())?;
        let prefix_len: u8 = len.parse().map_err(|_| bad())?;
        if prefix_len > 32 {
            return Err(bad());
        }
        let bits = u32::from(addr);
        let mask = Self::mask(prefix_len);
        if bits & !mask != 0 {
            return Err(EvalError::Function {
                name,
                message: format!("{text:?} has host bits set"),
            });
        }
        Ok(Self {
            network: bits,
            prefix_len,
        })
    }

    fn mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len))
        }
    }

    fn host_count(&self) -> u64 {
        1u64 << (32 - u64::from(self.prefix_len))
    }
}

/// `cidrvalid(string)`: whether the string is a well-formed IPv4 prefix.
fn cidrvalid(args: &[Value]) -> Result<Value, EvalError> {
    arity("cidrvalid", "1", args, args.len() == 1)?;
    let text = want_str("cidrvalid", &args[0])?;
    Ok(Value::Bool(Cidr::parse("cidrvalid", text).is_ok()))
}

/// `cidrhost(prefix, n)`: the n-th address inside the prefix.
fn cidrhost(args: &[Value]) -> Result<Value, EvalError> {
    arity("cidrhost", "2", args, args.len() == 2)?;
    let cidr = Cidr::parse("cidrhost", want_str("cidrhost", &args[0])?)?;
    let host = want_int("cidrhost", &args[1])?;
    if host < 0 || host as u64 >= cidr.host_count() {
        return Err(EvalError::Function {
            name: "cidrhost",
            message: format!(
                "host number {host} is outside a /{} prefix",
                cidr.prefix_len
            ),
        });
    }
    let addr = Ipv4Addr::from(cidr.network | host as u32);
    Ok(Value::String(addr.to_string()))
}

/// `cidrnetmask(prefix)`: the prefix length as a dotted-quad mask.
fn cidrnetmask(args: &[Value]) -> Result<Value, EvalError> {
    arity("cidrnetmask", "1", args, args.len() == 1)?;
    let cidr = Cidr::parse("cidrnetmask", want_str("cidrnetmask", &args[0])?)?;
    Ok(Value::String(
        Ipv4Addr::from(Cidr::mask(cidr.prefix_len)).to_string(),
    ))
}

/// `cidrcontains(prefix, address)`: whether the address is in the prefix.
fn cidrcontains(args: &[Value]) -> Result<Value, EvalError> {
    arity("cidrcontains", "2", args, args.len() == 2)?;
    let cidr = Cidr::parse("cidrcontains", want_str("cidrcontains", &args[0])?)?;
    let text = want_str("cidrcontains", &args[1])?;
    let addr: Ipv4Addr = text.parse().map_err(|_| EvalError::Function {
        name: "cidrcontains",
        message: format!("{text:?} is not a valid IPv4 address"),
    })?;
    let inside = u32::from(addr) & Cidr::mask(cidr.prefix_len) == cidr.network;
    Ok(Value::Bool(inside))
}

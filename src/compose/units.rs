//! Parsers for compose-style unit expressions
//!
//! Byte sizes (`512m`), durations (`1h30m`), shell-like commands, port
//! mappings (`127.0.0.1:8000-8002:80-82/udp`) and exposed ports.

use super::config::{CommandConfig, ExposeEntry, PortConfig, Scalar};
use crate::engine::{port_binding, ExposedPorts, PortMap};
use crate::error::{BerthError, Result};
use bollard::models::PortBinding;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

const MAX_PORT: u32 = 65_535;

const MICROS_PER_MILLI: u64 = 1_000;
const MICROS_PER_SECOND: u64 = 1_000_000;
const MICROS_PER_MINUTE: u64 = 60 * MICROS_PER_SECOND;
const MICROS_PER_HOUR: u64 = 60 * MICROS_PER_MINUTE;

fn bytes_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+(?:\.\d+)?)(b|kb|k|mb|m|gb|g|)$").expect("valid byte regex")
    })
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)(us|ms|s|m|h)").expect("valid duration regex"))
}

fn port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:\[?(.+?[^0-9-].+?)\]?:)?(\d+)(?:-(\d+))?(?::(\d+)(?:-(\d+))?)?(?:/(tcp|udp|sctp))?$",
        )
        .expect("valid port regex")
    })
}

fn expose_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(?:-(\d+))?(?:/(tcp|udp|sctp))?$").expect("valid expose regex"))
}

/// Parse a byte size such as `1024`, `1.5k`, `512mb` or `2G` into bytes (floored)
pub fn parse_bytes(expr: &Scalar) -> Result<i64> {
    match expr {
        Scalar::Int(n) => Ok(*n),
        Scalar::Float(f) => Ok(f.floor() as i64),
        Scalar::Bool(_) => Err(BerthError::parse(format!(
            "Invalid byte expression: {}",
            expr
        ))),
        Scalar::Str(s) => parse_bytes_str(s),
    }
}

/// String form of [`parse_bytes`]
pub fn parse_bytes_str(expr: &str) -> Result<i64> {
    let normalized = expr.trim().to_lowercase();
    let caps = bytes_regex()
        .captures(&normalized)
        .ok_or_else(|| BerthError::parse(format!("Invalid byte expression: {}", expr)))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| BerthError::parse(format!("Invalid byte expression: {}", expr)))?;
    let multiplier: f64 = match &caps[2] {
        "" | "b" => 1.0,
        "k" | "kb" => 1024.0,
        "m" | "mb" => 1024.0 * 1024.0,
        "g" | "gb" => 1024.0 * 1024.0 * 1024.0,
        _ => return Err(BerthError::parse(format!("Invalid byte expression: {}", expr))),
    };
    Ok((value * multiplier).floor() as i64)
}

/// Parse a duration into microseconds
///
/// Integers are taken as microseconds already. Strings are a sequence of
/// `<n><unit>` tokens with unit one of `us`, `ms`, `s`, `m`, `h`, summed.
/// Anything between or around the tokens is rejected.
pub fn parse_duration(expr: &Scalar) -> Result<u64> {
    match expr {
        Scalar::Int(n) if *n >= 0 => Ok(*n as u64),
        Scalar::Str(s) => parse_duration_str(s),
        _ => Err(BerthError::parse(format!("Invalid duration: {}", expr))),
    }
}

/// String form of [`parse_duration`]
pub fn parse_duration_str(expr: &str) -> Result<u64> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(BerthError::parse("Invalid duration: empty expression"));
    }
    if let Ok(micros) = trimmed.parse::<u64>() {
        return Ok(micros);
    }

    let mut total = 0f64;
    let mut consumed = 0;
    for caps in duration_regex().captures_iter(trimmed) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        if whole.start != consumed {
            return Err(BerthError::parse(format!("Invalid duration: {}", expr)));
        }
        consumed = whole.end;
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| BerthError::parse(format!("Invalid duration: {}", expr)))?;
        let unit = match &caps[2] {
            "us" => 1,
            "ms" => MICROS_PER_MILLI,
            "s" => MICROS_PER_SECOND,
            "m" => MICROS_PER_MINUTE,
            "h" => MICROS_PER_HOUR,
            other => {
                return Err(BerthError::parse(format!("Unsupported unit: {}", other)));
            }
        };
        total += value * unit as f64;
    }
    if consumed != trimmed.len() {
        return Err(BerthError::parse(format!("Invalid duration: {}", expr)));
    }
    Ok(total.floor() as u64)
}

/// Split a command into argv
///
/// The exec form passes through; the shell form is split on whitespace,
/// honoring single and double quotes and backslash escapes.
pub fn parse_command(cmd: &CommandConfig) -> Vec<String> {
    match cmd {
        CommandConfig::Exec(args) => args.clone(),
        CommandConfig::Shell(line) => split_command(line),
    }
}

/// Shell-like word splitting used by [`parse_command`]
pub fn split_command(line: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut quote: Option<char> = None;
    let mut escape = false;

    for c in line.chars() {
        if escape {
            current.push(c);
            started = true;
            escape = false;
        } else if c == '\\' {
            escape = true;
        } else if let Some(q) = quote {
            if c == q {
                quote = None;
            } else {
                current.push(c);
            }
        } else if c == '"' || c == '\'' {
            quote = Some(c);
            started = true;
        } else if c.is_whitespace() {
            if started {
                result.push(std::mem::take(&mut current));
                started = false;
            }
        } else {
            current.push(c);
            started = true;
        }
    }
    if started {
        result.push(current);
    }
    result
}

/// A parsed short-syntax port expression
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortSpec {
    ip: String,
    host: Option<(u32, Option<u32>)>,
    container: (u32, Option<u32>),
    protocol: String,
}

fn invalid_port(expr: impl fmt::Display) -> BerthError {
    BerthError::parse(format!("Invalid port expression: {}", expr))
}

/// Ports are 1..=65535; a host port of 0 is only ever implied
fn check_port(port: u32, expr: impl fmt::Display) -> Result<u32> {
    if (1..=MAX_PORT).contains(&port) {
        Ok(port)
    } else {
        Err(invalid_port(expr))
    }
}

fn parse_port_number(s: &str, expr: &str) -> Result<u32> {
    let port = s.parse().map_err(|_| invalid_port(expr))?;
    check_port(port, expr)
}

fn parse_port_spec(expr: &str) -> Result<PortSpec> {
    let caps = port_regex().captures(expr).ok_or_else(|| invalid_port(expr))?;

    let first = parse_port_number(&caps[2], expr)?;
    let first_end = caps
        .get(3)
        .map(|m| parse_port_number(m.as_str(), expr))
        .transpose()?;
    let second = caps
        .get(4)
        .map(|m| parse_port_number(m.as_str(), expr))
        .transpose()?;
    let second_end = caps
        .get(5)
        .map(|m| parse_port_number(m.as_str(), expr))
        .transpose()?;

    // with a second part the first one is the host side
    let (host, container) = match second {
        Some(container_start) => (Some((first, first_end)), (container_start, second_end)),
        None => (None, (first, first_end)),
    };

    if let Some((start, Some(end))) = host {
        if end < start {
            return Err(invalid_port(expr));
        }
    }
    if let (start, Some(end)) = container {
        if end < start {
            return Err(invalid_port(expr));
        }
    }

    Ok(PortSpec {
        ip: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        host,
        container,
        protocol: caps
            .get(6)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "tcp".to_string()),
    })
}

/// Host side of a long-syntax port: a port, a `start-end` range or empty
fn published_port(published: Option<&Scalar>) -> Result<String> {
    match published {
        None => Ok("0".to_string()),
        Some(Scalar::Str(s)) if s.trim().is_empty() => Ok("0".to_string()),
        Some(Scalar::Int(n)) => {
            let port = u32::try_from(*n).map_err(|_| invalid_port(n))?;
            Ok(check_port(port, n)?.to_string())
        }
        Some(Scalar::Str(s)) => {
            let s = s.trim();
            match s.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (parse_port_number(start, s)?, parse_port_number(end, s)?);
                    if end < start {
                        return Err(invalid_port(s));
                    }
                    Ok(format!("{}-{}", start, end))
                }
                None => Ok(parse_port_number(s, s)?.to_string()),
            }
        }
        Some(other) => Err(invalid_port(other)),
    }
}

fn bind(bindings: &mut PortMap, container_port: u32, protocol: &str, binding: PortBinding) {
    bindings
        .entry(format!("{}/{}", container_port, protocol))
        .or_default()
        .get_or_insert_with(Vec::new)
        .push(binding);
}

/// Build a `PortBindings` map from short, long and bare-number port entries
///
/// Accepted short forms:
/// * `80` / `80-82`: container ports on random host ports
/// * `8080:80`: one host port to one container port
/// * `8080-8082:80`: a host port range for one container port
/// * `8080-8082:80-82`: paired ranges of equal length, bound one to one
///
/// Multiple bindings for the same container port accumulate. Every port,
/// range bound included, must lie in 1..=65535.
pub fn parse_ports(defs: &[PortConfig]) -> Result<PortMap> {
    let mut bindings = PortMap::new();
    for def in defs {
        match def {
            PortConfig::Number(port) => {
                let port = check_port(*port, port)?;
                bind(&mut bindings, port, "tcp", port_binding("", "0"));
            }
            PortConfig::Short(expr) => {
                let spec = parse_port_spec(expr.trim())?;
                match (spec.host, spec.container) {
                    (Some((host_start, Some(host_end))), (container_start, Some(container_end))) => {
                        if host_end - host_start != container_end - container_start {
                            return Err(invalid_port(expr));
                        }
                        for i in 0..=(host_end - host_start) {
                            bind(
                                &mut bindings,
                                container_start + i,
                                &spec.protocol,
                                port_binding(&spec.ip, (host_start + i).to_string()),
                            );
                        }
                    }
                    (Some((host_start, Some(host_end))), (container, None)) => bind(
                        &mut bindings,
                        container,
                        &spec.protocol,
                        port_binding(&spec.ip, format!("{}-{}", host_start, host_end)),
                    ),
                    (Some((host, None)), (container, None)) => bind(
                        &mut bindings,
                        container,
                        &spec.protocol,
                        port_binding(&spec.ip, host.to_string()),
                    ),
                    (None, (container, None)) => bind(
                        &mut bindings,
                        container,
                        &spec.protocol,
                        port_binding(&spec.ip, "0"),
                    ),
                    (None, (container_start, Some(container_end))) => {
                        for port in container_start..=container_end {
                            bind(
                                &mut bindings,
                                port,
                                &spec.protocol,
                                port_binding(&spec.ip, "0"),
                            );
                        }
                    }
                    (Some((_, None)), (_, Some(_))) => return Err(invalid_port(expr)),
                }
            }
            PortConfig::Long(long) => {
                let target = check_port(long.target, long.target)?;
                let published = published_port(long.published.as_ref())?;
                bind(
                    &mut bindings,
                    target,
                    long.protocol.as_deref().unwrap_or("tcp"),
                    port_binding(
                        long.host_ip.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
                        published,
                    ),
                );
            }
        }
    }
    Ok(bindings)
}

/// Build the `ExposedPorts` set from `expose` entries
pub fn parse_expose(entries: &[ExposeEntry]) -> Result<ExposedPorts> {
    let mut exposed = ExposedPorts::new();
    for entry in entries {
        match entry {
            ExposeEntry::Number(port) => {
                let port = check_port(*port, port)?;
                exposed.insert(format!("{}/tcp", port), HashMap::new());
            }
            ExposeEntry::Range(expr) => {
                let trimmed = expr.trim();
                let caps = expose_regex()
                    .captures(trimmed)
                    .ok_or_else(|| invalid_port(expr))?;
                let start = parse_port_number(&caps[1], trimmed)?;
                let end = match caps.get(2) {
                    Some(m) => parse_port_number(m.as_str(), trimmed)?,
                    None => start,
                };
                if end < start {
                    return Err(invalid_port(expr));
                }
                let protocol = caps.get(3).map(|m| m.as_str()).unwrap_or("tcp");
                for port in start..=end {
                    exposed.insert(format!("{}/{}", port, protocol), HashMap::new());
                }
            }
        }
    }
    Ok(exposed)
}

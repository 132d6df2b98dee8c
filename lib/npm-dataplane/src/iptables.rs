// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A parser for `iptables-save(8)` output.
//!
//! The save format is line oriented:
//!
//! ```text
//! *filter
//! :INPUT ACCEPT [0:0]
//! :AZURE-NPM - [0:0]
//! -A AZURE-NPM-INGRESS -p tcp -m tcp --dport 80 -m set --match-set azure-npm-1 dst -j ACCEPT
//! COMMIT
//! ```
//!
//! A rule's options are grouped into [`Module`]s by the match
//! extension (`-m <verb>`) they follow; options given straight after
//! `-p <proto>` land in an implicit module named after the protocol.
//! A negated option (`! --opt`) is recorded as `not-opt`. Modules and
//! options are kept in the order they appear and may repeat. Rule
//! order within a chain is preserved exactly: it is first-match
//! semantics that gives the rules their meaning.

use crate::exec::CommandRunner;
use crate::exec::ExecError;
use core::fmt;
use core::fmt::Display;
use serde::Serialize;
use thiserror::Error;

pub const IPTABLES_SAVE: &str = "iptables-save";
pub const DEFAULT_TABLE: &str = "filter";

const NEGATED_PREFIX: &str = "not-";

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("table {0} has no COMMIT")]
    MissingCommit(String),

    #[error("line {line}: {msg}")]
    Malformed { line: usize, msg: String },
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

fn malformed(line: usize, msg: impl Into<String>) -> ParseError {
    ParseError::Malformed { line, msg: msg.into() }
}

/// Packet and byte counters, as printed in `[packets:bytes]` form.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

impl Counters {
    fn parse(s: &str) -> Option<Self> {
        let inner = s.strip_prefix('[')?.strip_suffix(']')?;
        let (packets, bytes) = inner.split_once(':')?;
        Some(Self {
            packets: packets.parse().ok()?,
            bytes: bytes.parse().ok()?,
        })
    }
}

impl Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}:{}]", self.packets, self.bytes)
    }
}

/// A single option and its values, e.g. `--match-set azure-npm-1 dst`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Opt {
    pub name: String,
    pub values: Vec<String>,
}

impl Opt {
    pub fn is_negated(&self) -> bool {
        self.name.starts_with(NEGATED_PREFIX)
    }

    /// The first value, if there is one.
    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }
}

fn write_value(f: &mut fmt::Formatter, v: &str) -> fmt::Result {
    if v.is_empty() || v.contains(char::is_whitespace) || v.contains('"') {
        write!(f, " \"{}\"", v.replace('"', "\\\""))
    } else {
        write!(f, " {v}")
    }
}

impl Display for Opt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name.strip_prefix(NEGATED_PREFIX) {
            Some(name) => write!(f, "! --{name}")?,
            None => write!(f, "--{}", self.name)?,
        }
        for v in &self.values {
            write_value(f, v)?;
        }
        Ok(())
    }
}

fn find_opt<'a>(opts: &'a [Opt], name: &str) -> Option<&'a Opt> {
    opts.iter().find(|o| o.name == name)
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Module {
    pub verb: String,
    /// Set for the module opened implicitly by `-p <proto>`.
    #[serde(skip)]
    pub implicit: bool,
    pub options: Vec<Opt>,
}

impl Module {
    pub fn get(&self, name: &str) -> Option<&Opt> {
        find_opt(&self.options, name)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Target {
    pub name: String,
    /// `-g` rather than `-j`.
    pub goto: bool,
    pub options: Vec<Opt>,
}

impl Target {
    pub fn get(&self, name: &str) -> Option<&Opt> {
        find_opt(&self.options, name)
    }
}

/// The base (non-extension) matches and their short flags.
const BASE_OPTS: &[(&str, &str)] = &[
    ("-s", "source"),
    ("-d", "destination"),
    ("-i", "in-interface"),
    ("-o", "out-interface"),
    ("-f", "fragment"),
];

fn base_opt_name(flag: &str) -> Option<&'static str> {
    BASE_OPTS
        .iter()
        .find(|(short, long)| {
            *short == flag || flag.strip_prefix("--") == Some(*long)
        })
        .map(|(_, long)| *long)
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Rule {
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<Counters>,
    /// Base matches such as `source` and `in-interface`.
    pub matches: Vec<Opt>,
    pub modules: Vec<Module>,
    pub target: Option<Target>,
}

impl Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts: Vec<String> = vec![];

        for m in &self.matches {
            let (name, neg) = match m.name.strip_prefix(NEGATED_PREFIX) {
                Some(name) => (name, "! "),
                None => (m.name.as_str(), ""),
            };
            let flag = BASE_OPTS
                .iter()
                .find(|(_, long)| *long == name)
                .map(|(short, _)| short.to_string())
                .unwrap_or_else(|| format!("--{name}"));
            let mut s = format!("{neg}{flag}");
            for v in &m.values {
                s.push(' ');
                s.push_str(v);
            }
            parts.push(s);
        }

        if let Some(proto) = &self.protocol {
            match proto.strip_prefix(NEGATED_PREFIX) {
                Some(p) => parts.push(format!("! -p {p}")),
                None => parts.push(format!("-p {proto}")),
            }
        }

        for module in &self.modules {
            if !module.implicit {
                parts.push(format!("-m {}", module.verb));
            }
            for opt in &module.options {
                parts.push(opt.to_string());
            }
        }

        if let Some(target) = &self.target {
            let flag = if target.goto { "-g" } else { "-j" };
            parts.push(format!("{flag} {}", target.name));
            for opt in &target.options {
                parts.push(opt.to_string());
            }
        }

        write!(f, "{}", parts.join(" "))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Chain {
    pub name: String,
    /// The built-in policy, or `-` for user chains.
    pub policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<Counters>,
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Table {
    pub name: String,
    pub chains: Vec<Chain>,
}

impl Table {
    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name == name)
    }

    fn chain_mut(&mut self, name: &str) -> &mut Chain {
        let idx = match self.chains.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.chains.push(Chain {
                    name: name.to_string(),
                    policy: "-".to_string(),
                    counters: None,
                    rules: vec![],
                });
                self.chains.len() - 1
            }
        };
        &mut self.chains[idx]
    }

    pub fn rule_count(&self) -> usize {
        self.chains.iter().map(|c| c.rules.len()).sum()
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "*{}", self.name)?;
        for chain in &self.chains {
            write!(f, ":{} {}", chain.name, chain.policy)?;
            match chain.counters {
                Some(c) => writeln!(f, " {c}")?,
                None => writeln!(f)?,
            }
        }
        for chain in &self.chains {
            for rule in &chain.rules {
                if let Some(c) = rule.counters {
                    write!(f, "{c} ")?;
                }
                writeln!(f, "-A {} {rule}", chain.name)?;
            }
        }
        writeln!(f, "COMMIT")
    }
}

#[derive(Debug, Eq, PartialEq)]
struct Token {
    text: String,
    quoted: bool,
}

impl Token {
    fn is_flag(&self) -> bool {
        !self.quoted && self.text.len() > 1 && self.text.starts_with('-')
    }

    fn is_bang(&self) -> bool {
        !self.quoted && self.text == "!"
    }
}

fn tokenize(line: &str, lineno: usize) -> Result<Vec<Token>, ParseError> {
    let mut tokens = vec![];
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut text = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(esc) = chars.next() {
                            text.push(esc);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => text.push(c),
                }
            }
            if !closed {
                return Err(malformed(lineno, "unterminated quote"));
            }
            tokens.push(Token { text, quoted: true });
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                text.push(c);
                chars.next();
            }
            tokens.push(Token { text, quoted: false });
        }
    }

    Ok(tokens)
}

/// Collect the values following an option, up to the next flag.
fn take_values<'a>(
    iter: &mut std::iter::Peekable<impl Iterator<Item = &'a Token>>,
) -> Vec<String> {
    let mut values = vec![];
    while let Some(tok) = iter.peek() {
        if tok.is_flag() || tok.is_bang() {
            break;
        }
        values.push(tok.text.clone());
        iter.next();
    }
    values
}

fn take_one<'a>(
    iter: &mut std::iter::Peekable<impl Iterator<Item = &'a Token>>,
    lineno: usize,
    flag: &str,
) -> Result<String, ParseError> {
    match iter.next() {
        Some(tok) if !tok.is_bang() => Ok(tok.text.clone()),
        _ => Err(malformed(lineno, format!("{flag} requires a value"))),
    }
}

/// Parse the part of a rule line following `-A <chain>`.
fn parse_rule(tokens: &[Token], lineno: usize) -> Result<Rule, ParseError> {
    enum Ctx {
        Base,
        Module,
        Target,
    }

    let mut rule = Rule::default();
    let mut ctx = Ctx::Base;
    let mut negate = false;
    let mut iter = tokens.iter().peekable();

    while let Some(tok) = iter.next() {
        if tok.is_bang() {
            negate = true;
            continue;
        }

        if !tok.is_flag() {
            return Err(malformed(
                lineno,
                format!("unexpected value {:?}", tok.text),
            ));
        }

        let flag = tok.text.as_str();
        let name = |n: &str| {
            if negate {
                format!("{NEGATED_PREFIX}{n}")
            } else {
                n.to_string()
            }
        };

        match flag {
            "-p" | "--protocol" => {
                let proto = take_one(&mut iter, lineno, flag)?;
                rule.protocol = Some(name(&proto));
                rule.modules.push(Module {
                    verb: proto,
                    implicit: true,
                    options: vec![],
                });
                ctx = Ctx::Module;
            }

            "-m" | "--match" => {
                let verb = take_one(&mut iter, lineno, flag)?;
                rule.modules.push(Module {
                    verb,
                    implicit: false,
                    options: vec![],
                });
                ctx = Ctx::Module;
            }

            "-j" | "--jump" | "-g" | "--goto" => {
                let target = take_one(&mut iter, lineno, flag)?;
                rule.target = Some(Target {
                    name: target,
                    goto: matches!(flag, "-g" | "--goto"),
                    options: vec![],
                });
                ctx = Ctx::Target;
            }

            _ => {
                if let Some(base) = base_opt_name(flag) {
                    let opt = Opt {
                        name: name(base),
                        values: take_values(&mut iter),
                    };
                    rule.matches.push(opt);
                } else if let Some(long) = flag.strip_prefix("--") {
                    let opt = Opt {
                        name: name(long),
                        values: take_values(&mut iter),
                    };
                    let opts = match ctx {
                        Ctx::Target => {
                            rule.target.as_mut().map(|t| &mut t.options)
                        }
                        Ctx::Module => {
                            rule.modules.last_mut().map(|m| &mut m.options)
                        }
                        Ctx::Base => None,
                    };
                    match opts {
                        Some(opts) => opts.push(opt),
                        None => rule.matches.push(opt),
                    }
                } else {
                    return Err(malformed(
                        lineno,
                        format!("unknown flag {flag}"),
                    ));
                }
            }
        }

        negate = false;
    }

    if negate {
        return Err(malformed(lineno, "dangling !"));
    }

    // `-p tcp -m tcp --dport 80` is how iptables-save writes protocol
    // matches; the implicit module carries nothing in that case.
    rule.modules.retain(|m| !m.implicit || !m.options.is_empty());
    Ok(rule)
}

fn parse_chain_decl(rest: &str, lineno: usize) -> Result<Chain, ParseError> {
    let mut fields = rest.split_whitespace();
    let name = fields
        .next()
        .ok_or_else(|| malformed(lineno, "chain declaration without name"))?;
    let policy = fields.next().unwrap_or("-");
    let counters = match fields.next() {
        Some(c) => Some(
            Counters::parse(c)
                .ok_or_else(|| malformed(lineno, format!("bad counters {c}")))?,
        ),
        None => None,
    };

    Ok(Chain {
        name: name.to_string(),
        policy: policy.to_string(),
        counters,
        rules: vec![],
    })
}

fn parse_rule_line(
    table: &mut Table,
    line: &str,
    lineno: usize,
) -> Result<(), ParseError> {
    let mut tokens = tokenize(line, lineno)?;

    let counters = match tokens.first() {
        Some(tok) if tok.text.starts_with('[') => {
            let c = Counters::parse(&tok.text).ok_or_else(|| {
                malformed(lineno, format!("bad counters {}", tok.text))
            })?;
            tokens.remove(0);
            Some(c)
        }
        _ => None,
    };

    match tokens.first().map(|t| t.text.as_str()) {
        Some("-A") | Some("--append") => {}
        _ => return Err(malformed(lineno, format!("unexpected line {line:?}"))),
    }

    let chain = tokens
        .get(1)
        .filter(|t| !t.is_flag())
        .map(|t| t.text.clone())
        .ok_or_else(|| malformed(lineno, "rule without chain"))?;

    let mut rule = parse_rule(&tokens[2..], lineno)?;
    rule.counters = counters;
    table.chain_mut(&chain).rules.push(rule);
    Ok(())
}

/// Parse every table in an `iptables-save` dump.
///
/// A malformed table aborts the whole dump; use [`parse_table`] to
/// pick out a single table without being affected by the others.
pub fn parse_tables(text: &str) -> Result<Vec<Table>, ParseError> {
    let mut tables = vec![];
    let mut current: Option<Table> = None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('*') {
            if let Some(t) = current.take() {
                return Err(ParseError::MissingCommit(t.name));
            }
            current = Some(Table { name: name.to_string(), chains: vec![] });
            continue;
        }

        let Some(table) = current.as_mut() else {
            return Err(malformed(lineno, "content outside of a table"));
        };

        if line == "COMMIT" {
            if let Some(t) = current.take() {
                tables.push(t);
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix(':') {
            let chain = parse_chain_decl(rest, lineno)?;
            match table.chains.iter_mut().find(|c| c.name == chain.name) {
                Some(existing) => {
                    existing.policy = chain.policy;
                    existing.counters = chain.counters;
                }
                None => table.chains.push(chain),
            }
            continue;
        }

        parse_rule_line(table, line, lineno)?;
    }

    if let Some(t) = current {
        return Err(ParseError::MissingCommit(t.name));
    }

    Ok(tables)
}

/// Parse only the table called `name` out of an `iptables-save` dump.
pub fn parse_table(text: &str, name: &str) -> Result<Table, ParseError> {
    let header = format!("*{name}");
    let mut section = String::new();
    let mut offset = 0;
    let mut found = false;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if !found {
            if line == header {
                found = true;
                offset = idx;
                section.push_str(line);
                section.push('\n');
            }
            continue;
        }

        section.push_str(raw);
        section.push('\n');
        if line == "COMMIT" {
            break;
        }
    }

    if !found {
        return Err(ParseError::TableNotFound(name.to_string()));
    }

    // Keep reported line numbers relative to the whole dump.
    let mut tables = parse_tables(&section).map_err(|e| match e {
        ParseError::Malformed { line, msg } => {
            ParseError::Malformed { line: line + offset, msg }
        }
        e => e,
    })?;

    tables.pop().ok_or_else(|| ParseError::MissingCommit(name.to_string()))
}

/// Dump and parse `table` from the running kernel.
pub fn iptables_save(
    runner: &dyn CommandRunner,
    table: &str,
) -> Result<Table, SaveError> {
    let out = runner.run(IPTABLES_SAVE, &["-t", table])?;
    Ok(parse_table(&out, table)?)
}

#[cfg(test)]
mod test {
    use super::*;

    const SAVE: &str = "\
# Generated by iptables-save v1.8.7 on Thu Jan  1 00:00:00 1970
*filter
:INPUT ACCEPT [120:4800]
:FORWARD ACCEPT [0:0]
:AZURE-NPM - [0:0]
:AZURE-NPM-INGRESS - [0:0]
-A FORWARD -m conntrack --ctstate NEW -j AZURE-NPM
-A AZURE-NPM -j AZURE-NPM-INGRESS
-A AZURE-NPM-INGRESS -p tcp -m tcp --dport 80 -m set --match-set azure-npm-1 dst -m set ! --match-set azure-npm-2 src -m comment --comment \"ALLOW web traffic\" -j ACCEPT
-A AZURE-NPM-INGRESS -i eth0 ! -s 10.0.0.0/8 -g AZURE-NPM
[3:180] -A AZURE-NPM-INGRESS -p udp --sport 53 -j DROP
COMMIT
";

    #[test]
    fn parse_filter() {
        let table = parse_table(SAVE, "filter").unwrap();
        assert_eq!(table.name, "filter");
        let names: Vec<_> = table.chains.iter().map(|c| &c.name[..]).collect();
        assert_eq!(
            names,
            vec!["INPUT", "FORWARD", "AZURE-NPM", "AZURE-NPM-INGRESS"]
        );
        assert_eq!(
            table.chain("INPUT").unwrap().counters,
            Some(Counters { packets: 120, bytes: 4800 })
        );
        assert_eq!(table.rule_count(), 5);

        let ingress = table.chain("AZURE-NPM-INGRESS").unwrap();
        let rule = &ingress.rules[0];
        assert_eq!(rule.protocol.as_deref(), Some("tcp"));
        assert_eq!(rule.target.as_ref().unwrap().name, "ACCEPT");

        let verbs: Vec<_> = rule.modules.iter().map(|m| &m.verb[..]).collect();
        assert_eq!(verbs, vec!["tcp", "set", "set", "comment"]);
        assert_eq!(rule.modules[0].get("dport").unwrap().value(), Some("80"));
        assert_eq!(
            rule.modules[1].get("match-set").unwrap().values,
            vec!["azure-npm-1", "dst"]
        );
        assert!(rule.modules[2].get("not-match-set").unwrap().is_negated());
        assert_eq!(
            rule.modules[3].get("comment").unwrap().value(),
            Some("ALLOW web traffic")
        );

        let goto = &ingress.rules[1];
        assert!(goto.target.as_ref().unwrap().goto);
        assert_eq!(goto.matches[0].name, "in-interface");
        assert_eq!(goto.matches[1].name, "not-source");

        let udp = &ingress.rules[2];
        assert_eq!(udp.counters, Some(Counters { packets: 3, bytes: 180 }));
        assert!(udp.modules[0].implicit);
        assert_eq!(udp.modules[0].get("sport").unwrap().value(), Some("53"));
    }

    #[test]
    fn round_trip_preserves_order() {
        let table = parse_table(SAVE, "filter").unwrap();
        let text = table.to_string();
        let again = parse_table(&text, "filter").unwrap();
        assert_eq!(table, again);

        let rule_lines: Vec<_> =
            text.lines().filter(|l| l.contains("-A ")).collect();
        assert_eq!(
            rule_lines[2],
            "-A AZURE-NPM-INGRESS -p tcp -m tcp --dport 80 -m set \
             --match-set azure-npm-1 dst -m set ! --match-set azure-npm-2 \
             src -m comment --comment \"ALLOW web traffic\" -j ACCEPT"
        );
        assert_eq!(
            rule_lines[3],
            "-A AZURE-NPM-INGRESS -i eth0 ! -s 10.0.0.0/8 -g AZURE-NPM"
        );
    }

    #[test]
    fn table_selection() {
        let dump = format!("*nat\n-A POSTROUTING -j BOGUS ???\n{SAVE}");
        // The broken nat table does not stop the filter table parsing.
        assert!(parse_table(&dump, "filter").is_ok());
        assert!(matches!(
            parse_table(&dump, "mangle"),
            Err(ParseError::TableNotFound(_))
        ));
        assert!(parse_tables(&dump).is_err());
    }

    #[test]
    fn malformed_lines() {
        let err = parse_table("*filter\n-A X -p\nCOMMIT\n", "filter");
        assert_eq!(
            err,
            Err(ParseError::Malformed {
                line: 2,
                msg: "-p requires a value".into()
            })
        );

        let dump = "*filter\n-A X -m comment --comment \"x\n";
        let err = parse_table(dump, "filter");
        assert!(matches!(err, Err(ParseError::Malformed { line: 2, .. })));

        let err = parse_table("*filter\n:INPUT ACCEPT [0:0]\n", "filter");
        assert_eq!(err, Err(ParseError::MissingCommit("filter".into())));
    }
}

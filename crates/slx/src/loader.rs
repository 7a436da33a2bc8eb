//! Loader for textual `.slx` shader bytecode.
//!
//! The format is whitespace-delimited: a shader-type keyword and the shader
//! name, local declarations, then the `init:` and `main:` sections made of
//! `Label_N:` markers, opcode mnemonics and literal/variable operands.

use crate::env::system_var_index;
use crate::error::{Error, Result};
use crate::program::{Cell, LocalDecl, Op, OperandSig, Program, ShaderType, VarId};
use crate::value::{StorageClass, ValueType};
use logos::Logos;
use smol_str::SmolStr;
use std::collections::HashMap;
use std::path::Path;

#[derive(Logos, Debug, Copy, Clone, PartialEq, Eq)]
enum Tok {
    #[error]
    #[regex(r"[ \t\r\n\f]+", logos::skip)]
    #[regex(r"#[^\n]*", logos::skip)]
    Error,

    #[regex(r#""([^"\\]|\\.)*""#)]
    Str,

    #[regex(r"-?([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][-+]?[0-9]+)?")]
    Number,

    #[regex(r"[A-Za-z_][A-Za-z0-9_$.]*:")]
    LabelDef,

    #[regex(r"[A-Za-z_][A-Za-z0-9_$.]*")]
    Ident,
}

struct Token<'a> {
    kind: Tok,
    text: &'a str,
    pos: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token<'_>>> {
    let mut lexer = Tok::lexer(source);
    let mut tokens = Vec::new();
    while let Some(kind) = lexer.next() {
        if kind == Tok::Error {
            return Err(Error::Lex(lexer.span().start));
        }
        tokens.push(Token {
            kind,
            text: lexer.slice(),
            pos: lexer.span().start,
        });
    }
    Ok(tokens)
}

fn unescape(quoted: &str) -> SmolStr {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => break,
            }
        } else {
            out.push(c);
        }
    }
    SmolStr::new(out)
}

fn class_keyword(word: &str) -> Option<StorageClass> {
    Some(match word {
        "constant" => StorageClass::Constant,
        "uniform" => StorageClass::Uniform,
        "varying" => StorageClass::Varying,
        "vertex" => StorageClass::Vertex,
        "facevarying" => StorageClass::FaceVarying,
        _ => return None,
    })
}

fn type_keyword(word: &str) -> Option<ValueType> {
    Some(match word {
        "float" => ValueType::Float,
        "point" => ValueType::Point,
        "vector" => ValueType::Vector,
        "normal" => ValueType::Normal,
        "color" => ValueType::Color,
        "matrix" => ValueType::Matrix,
        "string" => ValueType::String,
        "bool" => ValueType::Bool,
        _ => return None,
    })
}

struct Loader<'a> {
    tokens: Vec<Token<'a>>,
    cursor: usize,
    locals: Vec<LocalDecl>,
}

impl<'a> Loader<'a> {
    fn peek(&self) -> Option<&Token<'a>> {
        self.tokens.get(self.cursor)
    }

    fn next(&mut self) -> Result<&Token<'a>> {
        let t = self.tokens.get(self.cursor).ok_or(Error::UnexpectedEof)?;
        self.cursor += 1;
        Ok(t)
    }

    fn expect_ident(&mut self) -> Result<&'a str> {
        let t = self.next()?;
        if t.kind == Tok::Ident {
            Ok(t.text)
        } else {
            Err(Error::UnexpectedToken {
                expected: "identifier",
                found: t.text.to_string(),
            })
        }
    }

    fn expect_number(&mut self) -> Result<f32> {
        let t = self.next()?;
        if t.kind == Tok::Number {
            t.text.parse().map_err(|_| Error::UnexpectedToken {
                expected: "number",
                found: t.text.to_string(),
            })
        } else {
            Err(Error::UnexpectedToken {
                expected: "number",
                found: t.text.to_string(),
            })
        }
    }

    fn find_local(&self, name: &str) -> Option<usize> {
        self.locals.iter().position(|l| l.name == name)
    }

    fn resolve_var(&self, name: &str) -> Result<VarId> {
        if let Some(i) = self.find_local(name) {
            return Ok(VarId::local(i));
        }
        if let Some(i) = system_var_index(name) {
            return Ok(VarId::system(i));
        }
        Err(Error::UnknownVariable(SmolStr::new(name)))
    }

    /// Parses declarations until a section marker is seen.
    fn parse_declarations(&mut self) -> Result<()> {
        loop {
            let Some(t) = self.peek() else { break };
            let (kind, text) = (t.kind, t.text);
            if kind == Tok::LabelDef {
                break;
            }
            if kind != Tok::Ident {
                return Err(Error::UnexpectedToken {
                    expected: "declaration or section",
                    found: text.to_string(),
                });
            }
            let mut param = false;
            let mut output = false;
            let mut class = None;
            let mut ty = None;
            loop {
                let word = self.expect_ident()?;
                match word {
                    "param" => param = true,
                    "output" => output = true,
                    "external" => {
                        return Err(Error::ExternalCall(SmolStr::new(word)));
                    }
                    w => {
                        if let Some(c) = class_keyword(w) {
                            class = Some(c);
                        } else if let Some(t) = type_keyword(w) {
                            ty = Some(t);
                        } else {
                            return Err(Error::MalformedDeclaration(format!(
                                "unexpected word `{w}`"
                            )));
                        }
                    }
                }
                if class.is_some() && ty.is_some() {
                    break;
                }
            }
            // Optional array length before the name.
            let mut array_len = 0usize;
            let has_len =
                matches!(self.peek(), Some(t) if t.kind == Tok::Number && !t.text.contains('.'));
            if has_len {
                array_len = self.expect_number()? as usize;
            }
            let name = self.expect_ident()?;
            self.locals.push(LocalDecl {
                name: SmolStr::new(name),
                ty: ty.unwrap(),
                class: class.unwrap(),
                array_len,
                output,
                param,
            });
        }
        Ok(())
    }

    /// Parses one `Label_N:`-structured section up to `stop` or EOF.
    fn parse_section(&mut self, stop: Option<&str>) -> Result<Vec<Cell>> {
        let mut cells = Vec::new();
        let mut labels: HashMap<SmolStr, usize> = HashMap::new();
        let mut fixups: Vec<(usize, SmolStr)> = Vec::new();

        loop {
            let Some(t) = self.peek() else { break };
            let (kind, text) = (t.kind, t.text);
            match kind {
                Tok::LabelDef => {
                    let name = &text[..text.len() - 1];
                    if Some(name) == stop {
                        break;
                    }
                    labels.insert(SmolStr::new(name), cells.len());
                    self.cursor += 1;
                }
                Tok::Ident => {
                    let mnemonic = text;
                    let op = Op::lookup(mnemonic)
                        .ok_or_else(|| Error::UnknownOpcode(SmolStr::new(mnemonic)))?;
                    self.cursor += 1;
                    cells.push(Cell::Op(op));
                    match op.operands() {
                        OperandSig::None => {}
                        OperandSig::F1 => {
                            let f = self.expect_number()?;
                            cells.push(Cell::Float(f));
                        }
                        OperandSig::F3 => {
                            for _ in 0..3 {
                                let f = self.expect_number()?;
                                cells.push(Cell::Float(f));
                            }
                        }
                        OperandSig::Str => {
                            let t = self.next()?;
                            if t.kind != Tok::Str {
                                return Err(Error::UnexpectedToken {
                                    expected: "string literal",
                                    found: t.text.to_string(),
                                });
                            }
                            let s = unescape(t.text);
                            cells.push(Cell::Str(s));
                        }
                        OperandSig::Var => {
                            let name = self.expect_ident()?;
                            let var = self.resolve_var(name)?;
                            cells.push(Cell::Var(var));
                        }
                        OperandSig::Label => {
                            let name = self.expect_ident()?;
                            fixups.push((cells.len(), SmolStr::new(name)));
                            cells.push(Cell::Label(0));
                        }
                    }
                }
                _ => {
                    return Err(Error::UnexpectedToken {
                        expected: "opcode or label",
                        found: text.to_string(),
                    });
                }
            }
        }

        for (cell, name) in fixups {
            let target = *labels
                .get(&name)
                .ok_or_else(|| Error::UndefinedLabel(name.clone()))?;
            cells[cell] = Cell::Label(target);
        }
        Ok(cells)
    }
}

/// Loads a shader program from `.slx` source text.
pub fn load_program(source: &str) -> Result<Program> {
    let tokens = tokenize(source)?;
    let mut loader = Loader {
        tokens,
        cursor: 0,
        locals: Vec::new(),
    };

    let type_word = loader.expect_ident()?;
    let shader_type = ShaderType::from_keyword(type_word)
        .ok_or_else(|| Error::UnknownShaderType(SmolStr::new(type_word)))?;
    let name = SmolStr::new(loader.expect_ident()?);

    loader.parse_declarations()?;

    // `init:` then `main:` as section markers.
    let mut init = Vec::new();
    if matches!(loader.peek(), Some(t) if t.kind == Tok::LabelDef && t.text == "init:") {
        loader.cursor += 1;
        init = loader.parse_section(Some("main"))?;
    }
    let mut main = Vec::new();
    if matches!(loader.peek(), Some(t) if t.kind == Tok::LabelDef && t.text == "main:") {
        loader.cursor += 1;
        main = loader.parse_section(None)?;
    }
    if main.is_empty() && init.is_empty() {
        return Err(Error::EmptyProgram(name));
    }

    Ok(Program {
        shader_type,
        name,
        locals: loader.locals,
        init,
        main,
    })
}

/// Loads a shader program from a `.slx` file on disk.
pub fn load_file(path: impl AsRef<Path>) -> Result<Program> {
    let source = std::fs::read_to_string(path)?;
    load_program(&source)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONSTANT_SRC: &str = r#"
surface
constant_red
param uniform color tint
init:
Label_0:
main:
Label_0:
	pushif 1
	pushif 0
	pushif 0
	settc
	pop Ci
	pushv Os
	pop Oi
"#;

    #[test]
    fn loads_a_simple_surface() {
        let prog = load_program(CONSTANT_SRC).unwrap();
        assert_eq!(prog.shader_type, ShaderType::Surface);
        assert_eq!(prog.name, "constant_red");
        assert_eq!(prog.locals.len(), 1);
        assert_eq!(prog.locals[0].name, "tint");
        assert!(prog.locals[0].param);
        assert_eq!(prog.main[0], Cell::Op(Op::Pushif));
        assert_eq!(prog.main[1], Cell::Float(1.0));
    }

    #[test]
    fn resolves_system_and_local_variables() {
        let prog = load_program(CONSTANT_SRC).unwrap();
        let vars: Vec<_> = prog
            .main
            .iter()
            .filter_map(|c| match c {
                Cell::Var(v) => Some(*v),
                _ => None,
            })
            .collect();
        assert!(vars.iter().all(|v| v.is_system()));
    }

    #[test]
    fn labels_resolve_forward() {
        let src = r#"
surface jumpy
main:
Label_0:
	jmp Label_1
	pushif 2
Label_1:
	pushif 3
"#;
        let prog = load_program(src).unwrap();
        // jmp operand points at the cell after `pushif 2`.
        assert_eq!(prog.main[1], Cell::Label(4));
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let src = "surface bad\nmain:\nLabel_0:\n\tfrobnicate\n";
        match load_program(src) {
            Err(Error::UnknownOpcode(op)) => assert_eq!(op, "frobnicate"),
            other => panic!("expected unknown opcode, got {other:?}"),
        }
    }

    #[test]
    fn string_literals_unescape() {
        let src = "surface s\nmain:\nLabel_0:\n\tpushis \"a\\nb\"\n\tpop Ci\n";
        let prog = load_program(src).unwrap();
        assert_eq!(prog.main[1], Cell::Str(SmolStr::new("a\nb")));
    }

    #[test]
    fn array_declarations() {
        let src = "surface s\nparam uniform float 4 weights\nmain:\nLabel_0:\n\tpushv weights\n\tpop Ci\n";
        let prog = load_program(src).unwrap();
        assert_eq!(prog.locals[0].array_len, 4);
    }
}

//! Groups a RIB token stream into requests and hands them to a handler.

use crate::error::{Error, Result};
use crate::lexer::{line_col, tokenize, Token};
use crate::{ParamValue, Request, Value};
use smol_str::SmolStr;
use tracing::warn;

/// Receives each parsed request. Returning an error aborts the parse.
pub trait RequestHandler {
    fn handle(&mut self, request: Request) -> Result<(), Box<dyn std::error::Error>>;
}

/// Parses a whole RIB stream, invoking `handler` per request. Unknown
/// requests still parse (their shape is self-describing); the handler
/// decides what to do with them.
pub fn parse(source: &str, handler: &mut dyn RequestHandler) -> Result<()> {
    let tokens = tokenize(source)?;
    let mut cursor = 0usize;

    while cursor < tokens.len() {
        let (tok, offset) = &tokens[cursor];
        let name = match tok {
            Token::Request(name) => name.clone(),
            _ => {
                let (line, col) = line_col(source, *offset);
                warn!(line, col, "skipping stray token outside a request");
                cursor += 1;
                continue;
            }
        };
        cursor += 1;

        // Positional values run until the next request or a string that
        // begins the parameter list.
        let mut positional = Vec::new();
        let mut params = Vec::new();
        let mut in_params = false;
        while cursor < tokens.len() {
            match &tokens[cursor] {
                (Token::Request(_), _) => break,
                (Token::String(s), offset) => {
                    // A string token may be a positional argument (e.g.
                    // Display's name) or a parameter-list key; keys are
                    // always followed by a value.
                    let looks_like_key = matches!(
                        tokens.get(cursor + 1),
                        Some((Token::BeginArray, _))
                            | Some((Token::Integer(_), _))
                            | Some((Token::Float(_), _))
                            | Some((Token::String(_), _))
                    ) && (in_params || declares_param(s));
                    if looks_like_key {
                        in_params = true;
                        cursor += 1;
                        let value = parse_value(source, &tokens, &mut cursor, &name)?;
                        params.push(ParamValue {
                            name: s.clone(),
                            value,
                        });
                    } else if in_params {
                        let (line, col) = line_col(source, *offset);
                        return Err(Error::ExpectedParamName { line, col });
                    } else {
                        positional.push(Value::Str(s.clone()));
                        cursor += 1;
                    }
                }
                _ => {
                    if in_params {
                        let offset0 = tokens[cursor].1;
                        let (line, col) = line_col(source, offset0);
                        return Err(Error::ExpectedParamName { line, col });
                    }
                    let value = parse_value(source, &tokens, &mut cursor, &name)?;
                    positional.push(value);
                }
            }
        }

        handler
            .handle(Request {
                name,
                positional,
                params,
            })
            .map_err(|e| {
                warn!("request handler error: {e}");
                Error::TruncatedRequest(e.to_string())
            })?;
    }
    Ok(())
}

/// Heuristic for parameter-list keys: inline declarations ("uniform float
/// foo") and the well-known token names.
fn declares_param(s: &SmolStr) -> bool {
    let known = [
        "P", "Pw", "Pz", "N", "Np", "Cs", "Os", "st", "s", "t", "width", "constantwidth",
        "fov", "intensity", "lightcolor", "from", "to", "Ka", "Kd", "Ks", "roughness",
        "specularcolor",
    ];
    known.contains(&s.as_str()) || s.contains(' ')
}

fn parse_value(
    source: &str,
    tokens: &[(Token, usize)],
    cursor: &mut usize,
    request: &SmolStr,
) -> Result<Value> {
    match &tokens[*cursor] {
        (Token::Integer(i), _) => {
            *cursor += 1;
            Ok(Value::Int(*i))
        }
        (Token::Float(f), _) => {
            *cursor += 1;
            Ok(Value::Float(*f))
        }
        (Token::String(s), _) => {
            *cursor += 1;
            Ok(Value::Str(s.clone()))
        }
        (Token::BeginArray, offset) => {
            let start = *offset;
            *cursor += 1;
            let mut floats = Vec::new();
            let mut ints = Vec::new();
            let mut strs = Vec::new();
            loop {
                match tokens.get(*cursor) {
                    Some((Token::EndArray, _)) => {
                        *cursor += 1;
                        break;
                    }
                    Some((Token::Integer(i), _)) => {
                        ints.push(*i);
                        floats.push(*i as f32);
                        *cursor += 1;
                    }
                    Some((Token::Float(f), _)) => {
                        floats.push(*f);
                        *cursor += 1;
                    }
                    Some((Token::String(s), _)) => {
                        strs.push(s.clone());
                        *cursor += 1;
                    }
                    Some((Token::BeginArray, offset)) | Some((Token::Request(_), offset)) => {
                        let (line, col) = line_col(source, *offset);
                        return Err(Error::UnterminatedArray { line, col });
                    }
                    None => {
                        let (line, col) = line_col(source, start);
                        let _ = (line, col);
                        return Err(Error::TruncatedRequest(request.to_string()));
                    }
                }
            }
            if !strs.is_empty() {
                Ok(Value::StrArray(strs))
            } else if ints.len() == floats.len() {
                Ok(Value::IntArray(ints))
            } else {
                Ok(Value::FloatArray(floats))
            }
        }
        (Token::EndArray, offset) => {
            let (line, col) = line_col(source, *offset);
            Err(Error::StrayArrayEnd { line, col })
        }
        (Token::Request(_), _) => Err(Error::TruncatedRequest(request.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collector {
        requests: Vec<Request>,
    }

    impl RequestHandler for Collector {
        fn handle(&mut self, request: Request) -> Result<(), Box<dyn std::error::Error>> {
            self.requests.push(request);
            Ok(())
        }
    }

    fn parse_all(src: &str) -> Vec<Request> {
        let mut c = Collector::default();
        parse(src, &mut c).unwrap();
        c.requests
    }

    #[test]
    fn positional_arguments() {
        let reqs = parse_all("Sphere 1 -1 1 360\nTranslate 0 0 5\n");
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].name, "Sphere");
        assert_eq!(reqs[0].floats(), vec![1.0, -1.0, 1.0, 360.0]);
        assert_eq!(reqs[1].name, "Translate");
    }

    #[test]
    fn parameter_lists() {
        let reqs = parse_all(
            r#"Patch "bilinear" "P" [0 0 0  1 0 0  0 1 0  1 1 0] "Cs" [1 0 0 0 1 0 0 0 1 1 1 1]"#,
        );
        assert_eq!(reqs.len(), 1);
        let r = &reqs[0];
        assert_eq!(r.positional[0], Value::Str("bilinear".into()));
        let p = r.param("P").unwrap();
        assert_eq!(p.value.as_floats().len(), 12);
        assert!(r.param("Cs").is_some());
        assert!(r.param("nope").is_none());
    }

    #[test]
    fn inline_declarations_are_keys() {
        let reqs =
            parse_all(r#"Surface "matte" "uniform float Kd" [0.8]"#);
        let r = &reqs[0];
        assert_eq!(r.params.len(), 1);
        assert_eq!(r.params[0].name, "uniform float Kd");
        assert_eq!(r.params[0].value.as_floats(), vec![0.8]);
    }

    #[test]
    fn display_strings_stay_positional() {
        let reqs = parse_all(r#"Display "out.tif" "file" "rgba""#);
        let r = &reqs[0];
        assert_eq!(r.positional.len(), 3);
        assert!(r.params.is_empty());
    }

    #[test]
    fn int_arrays_stay_integral() {
        let reqs = parse_all(r#"PatchMesh "bicubic" 4 "nonperiodic" 4 "nonperiodic" "P" [0 0 0]"#);
        let r = &reqs[0];
        assert_eq!(r.positional[1], Value::Int(4));
        match &r.param("P").unwrap().value {
            Value::IntArray(v) => assert_eq!(v, &vec![0, 0, 0]),
            other => panic!("expected int array, got {other:?}"),
        }
    }

    #[test]
    fn world_block_round_trip() {
        let src = r#"
Display "frame.tif" "framebuffer" "rgb"
Projection "perspective" "fov" [45]
WorldBegin
AttributeBegin
Color [1 0 0]
Sphere 1 -1 1 360
AttributeEnd
WorldEnd
"#;
        let reqs = parse_all(src);
        let names: Vec<&str> = reqs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Display",
                "Projection",
                "WorldBegin",
                "AttributeBegin",
                "Color",
                "Sphere",
                "AttributeEnd",
                "WorldEnd"
            ]
        );
    }
}

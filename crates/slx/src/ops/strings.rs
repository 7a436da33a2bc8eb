//! String shadeop helpers: `format`/`printf` expansion and `match`.

use glam::Vec3;
use regex::Regex;

/// One argument to a format expansion.
#[derive(Clone, Debug)]
pub enum FormatArg {
    Float(f32),
    Triple(Vec3),
    Str(String),
}

/// Expands a shading-language format string. Directives: `%f` and `%d` for
/// floats, `%p`/`%c`/`%v`/`%n` for triples, `%s` for strings, `%%` for a
/// literal percent. Unmatched directives print as-is.
pub fn format(fmt: &str, args: &[FormatArg]) -> String {
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    let mut next_arg = 0usize;
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(d @ ('f' | 'd' | 'p' | 'c' | 'v' | 'n' | 's')) => {
                let arg = args.get(next_arg);
                next_arg += 1;
                match (d, arg) {
                    ('d', Some(FormatArg::Float(f))) => out.push_str(&format!("{}", *f as i64)),
                    (_, Some(FormatArg::Float(f))) => out.push_str(&format!("{f}")),
                    (_, Some(FormatArg::Triple(p))) => {
                        out.push_str(&format!("{} {} {}", p.x, p.y, p.z))
                    }
                    (_, Some(FormatArg::Str(s))) => out.push_str(s),
                    (_, None) => {
                        out.push('%');
                        out.push(d);
                    }
                }
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// `match(pattern, subject)`: 1.0 when the regular expression matches.
pub fn match_pattern(pattern: &str, subject: &str) -> f32 {
    match Regex::new(pattern) {
        Ok(re) => {
            if re.is_match(subject) {
                1.0
            } else {
                0.0
            }
        }
        Err(_) => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_directives() {
        let s = format(
            "f=%f d=%d s=%s p=%p done %%",
            &[
                FormatArg::Float(1.5),
                FormatArg::Float(2.7),
                FormatArg::Str("hi".into()),
                FormatArg::Triple(Vec3::new(1.0, 2.0, 3.0)),
            ],
        );
        assert_eq!(s, "f=1.5 d=2 s=hi p=1 2 3 done %");
    }

    #[test]
    fn missing_args_print_directive() {
        assert_eq!(format("a %f b", &[]), "a %f b");
    }

    #[test]
    fn match_is_regex() {
        assert_eq!(match_pattern("^gr[ie]d$", "grid"), 1.0);
        assert_eq!(match_pattern("^gr[ie]d$", "grind"), 0.0);
        assert_eq!(match_pattern("(", "anything"), 0.0);
    }
}

//! Resolved shader programs: cells, opcodes and local declarations.

use crate::value::{StorageClass, ValueType};
use smol_str::SmolStr;

/// Kind of shader a program implements.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderType {
    Surface,
    Light,
    Volume,
    Displacement,
    Imager,
    Transformation,
    Atmosphere,
}

impl ShaderType {
    pub fn from_keyword(kw: &str) -> Option<ShaderType> {
        Some(match kw {
            "surface" => ShaderType::Surface,
            "light" => ShaderType::Light,
            "volume" => ShaderType::Volume,
            "displacement" => ShaderType::Displacement,
            "imager" => ShaderType::Imager,
            "transformation" => ShaderType::Transformation,
            "atmosphere" => ShaderType::Atmosphere,
            _ => return None,
        })
    }
}

/// Variable operand: index into the shader locals, or, with the high bit
/// set, into the environment's system variables.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VarId(pub u16);

impl VarId {
    pub const SYSTEM_BIT: u16 = 0x8000;

    pub fn local(index: usize) -> VarId {
        VarId(index as u16)
    }

    pub fn system(index: usize) -> VarId {
        VarId(index as u16 | Self::SYSTEM_BIT)
    }

    pub fn is_system(self) -> bool {
        self.0 & Self::SYSTEM_BIT != 0
    }

    pub fn index(self) -> usize {
        (self.0 & !Self::SYSTEM_BIT) as usize
    }
}

/// One element of the flat program stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Op(Op),
    Float(f32),
    Str(SmolStr),
    Var(VarId),
    /// Resolved jump target: cell offset within the section.
    Label(usize),
}

/// Operand cells an opcode consumes from the stream after itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandSig {
    None,
    /// One float literal.
    F1,
    /// Three float literals.
    F3,
    /// One interned string.
    Str,
    /// One variable index.
    Var,
    /// One label.
    Label,
}

impl OperandSig {
    pub fn cell_count(self) -> usize {
        match self {
            OperandSig::None => 0,
            OperandSig::F1 | OperandSig::Str | OperandSig::Var | OperandSig::Label => 1,
            OperandSig::F3 => 3,
        }
    }
}

/// Declaration of a shader local (parameters included).
#[derive(Clone, Debug)]
pub struct LocalDecl {
    pub name: SmolStr,
    pub ty: ValueType,
    pub class: StorageClass,
    pub array_len: usize,
    pub output: bool,
    pub param: bool,
}

/// A loaded shader program: two flat cell streams plus local declarations.
#[derive(Clone, Debug)]
pub struct Program {
    pub shader_type: ShaderType,
    pub name: SmolStr,
    pub locals: Vec<LocalDecl>,
    pub init: Vec<Cell>,
    pub main: Vec<Cell>,
}

macro_rules! opcodes {
    ($($variant:ident = $mnemonic:literal / $sig:ident;)*) => {
        /// Every opcode the interpreter understands.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        #[allow(clippy::upper_case_acronyms)]
        pub enum Op {
            $($variant,)*
        }

        impl Op {
            /// Resolves a mnemonic from a `.slx` stream.
            pub fn lookup(mnemonic: &str) -> Option<Op> {
                match mnemonic {
                    $($mnemonic => Some(Op::$variant),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Op::$variant => $mnemonic,)*
                }
            }

            /// What operand cells follow this opcode in the stream.
            pub fn operands(self) -> OperandSig {
                match self {
                    $(Op::$variant => OperandSig::$sig,)*
                }
            }
        }
    };
}

opcodes! {
    // Stack.
    Nop = "nop" / None;
    Dup = "dup" / None;
    Drop = "drop" / None;
    DebugBreak = "debug_break" / None;
    Pushif = "pushif" / F1;
    Puship = "puship" / F3;
    Pushis = "pushis" / Str;
    Pushv = "pushv" / Var;
    Ipushv = "ipushv" / Var;
    Pop = "pop" / Var;
    Ipop = "ipop" / Var;
    // Per-lane selects.
    Mergef = "mergef" / None;
    Merges = "merges" / None;
    Mergep = "mergep" / None;
    Mergec = "mergec" / None;
    // Casts and constructors.
    Setfc = "setfc" / None;
    Setfp = "setfp" / None;
    Setfm = "setfm" / None;
    Settc = "settc" / None;
    Settp = "settp" / None;
    Setpc = "setpc" / None;
    Setcp = "setcp" / None;
    Setwm = "setwm" / None;
    // Running state.
    RsPush = "RS_PUSH" / None;
    RsPop = "RS_POP" / None;
    RsGet = "RS_GET" / None;
    RsInverse = "RS_INVERSE" / None;
    SClear = "S_CLEAR" / None;
    SGet = "S_GET" / None;
    RsJz = "RS_JZ" / Label;
    RsJnz = "RS_JNZ" / Label;
    SJz = "S_JZ" / Label;
    SJnz = "S_JNZ" / Label;
    Jnz = "jnz" / Label;
    Jz = "jz" / Label;
    Jmp = "jmp" / Label;
    // Comparisons.
    Lsff = "lsff" / None;
    Lspp = "lspp" / None;
    Lscc = "lscc" / None;
    Gtff = "gtff" / None;
    Gtpp = "gtpp" / None;
    Gtcc = "gtcc" / None;
    Geff = "geff" / None;
    Gepp = "gepp" / None;
    Gecc = "gecc" / None;
    Leff = "leff" / None;
    Lepp = "lepp" / None;
    Lecc = "lecc" / None;
    Eqff = "eqff" / None;
    Eqpp = "eqpp" / None;
    Eqcc = "eqcc" / None;
    Eqss = "eqss" / None;
    Eqmm = "eqmm" / None;
    Neff = "neff" / None;
    Nepp = "nepp" / None;
    Necc = "necc" / None;
    Ness = "ness" / None;
    Nemm = "nemm" / None;
    // Arithmetic.
    Mulff = "mulff" / None;
    Divff = "divff" / None;
    Addff = "addff" / None;
    Subff = "subff" / None;
    Negf = "negf" / None;
    Mulpp = "mulpp" / None;
    Divpp = "divpp" / None;
    Addpp = "addpp" / None;
    Subpp = "subpp" / None;
    Crspp = "crspp" / None;
    Dotpp = "dotpp" / None;
    Negp = "negp" / None;
    Mulcc = "mulcc" / None;
    Divcc = "divcc" / None;
    Addcc = "addcc" / None;
    Subcc = "subcc" / None;
    Crscc = "crscc" / None;
    Dotcc = "dotcc" / None;
    Negc = "negc" / None;
    Mulfp = "mulfp" / None;
    Divfp = "divfp" / None;
    Addfp = "addfp" / None;
    Subfp = "subfp" / None;
    Mulfc = "mulfc" / None;
    Divfc = "divfc" / None;
    Addfc = "addfc" / None;
    Subfc = "subfc" / None;
    Mulmm = "mulmm" / None;
    Divmm = "divmm" / None;
    Land = "land" / None;
    Lor = "lor" / None;
    // Math.
    Radians = "radians" / None;
    Degrees = "degrees" / None;
    Sin = "sin" / None;
    Asin = "asin" / None;
    Cos = "cos" / None;
    Acos = "acos" / None;
    Tan = "tan" / None;
    Atan = "atan" / None;
    Atan2 = "atan2" / None;
    Pow = "pow" / None;
    Exp = "exp" / None;
    Sqrt = "sqrt" / None;
    Inversesqrt = "inversesqrt" / None;
    Log = "log" / None;
    Log2 = "log2" / None;
    Mod = "mod" / None;
    Abs = "abs" / None;
    Sign = "sign" / None;
    Min = "min" / None;
    Max = "max" / None;
    Pmin = "pmin" / None;
    Pmax = "pmax" / None;
    Vmin = "vmin" / None;
    Vmax = "vmax" / None;
    Nmin = "nmin" / None;
    Nmax = "nmax" / None;
    Cmin = "cmin" / None;
    Cmax = "cmax" / None;
    Clamp = "clamp" / None;
    Pclamp = "pclamp" / None;
    Cclamp = "cclamp" / None;
    Floor = "floor" / None;
    Ceil = "ceil" / None;
    Round = "round" / None;
    Step = "step" / None;
    Smoothstep = "smoothstep" / None;
    Filterstep = "filterstep" / None;
    Filterstep2 = "filterstep2" / None;
    // Splines.
    Fspline = "fspline" / None;
    Cspline = "cspline" / None;
    Pspline = "pspline" / None;
    Sfspline = "sfspline" / None;
    Scspline = "scspline" / None;
    Spspline = "spspline" / None;
    Fsplinea = "fsplinea" / None;
    Csplinea = "csplinea" / None;
    Psplinea = "psplinea" / None;
    Sfsplinea = "sfsplinea" / None;
    Scsplinea = "scsplinea" / None;
    Spsplinea = "spsplinea" / None;
    // Derivatives.
    FDu = "fDu" / None;
    FDv = "fDv" / None;
    FDeriv = "fDeriv" / None;
    CDu = "cDu" / None;
    CDv = "cDv" / None;
    CDeriv = "cDeriv" / None;
    PDu = "pDu" / None;
    PDv = "pDv" / None;
    PDeriv = "pDeriv" / None;
    // Random and noise.
    Frandom = "frandom" / None;
    Crandom = "crandom" / None;
    Prandom = "prandom" / None;
    Noise1 = "noise1" / None;
    Noise2 = "noise2" / None;
    Noise3 = "noise3" / None;
    Noise4 = "noise4" / None;
    Cnoise1 = "cnoise1" / None;
    Cnoise2 = "cnoise2" / None;
    Cnoise3 = "cnoise3" / None;
    Cnoise4 = "cnoise4" / None;
    Pnoise1 = "pnoise1" / None;
    Pnoise2 = "pnoise2" / None;
    Pnoise3 = "pnoise3" / None;
    Pnoise4 = "pnoise4" / None;
    Fcellnoise1 = "fcellnoise1" / None;
    Fcellnoise2 = "fcellnoise2" / None;
    Fcellnoise3 = "fcellnoise3" / None;
    Fcellnoise4 = "fcellnoise4" / None;
    Ccellnoise1 = "ccellnoise1" / None;
    Ccellnoise2 = "ccellnoise2" / None;
    Ccellnoise3 = "ccellnoise3" / None;
    Ccellnoise4 = "ccellnoise4" / None;
    Pcellnoise1 = "pcellnoise1" / None;
    Pcellnoise2 = "pcellnoise2" / None;
    Pcellnoise3 = "pcellnoise3" / None;
    Pcellnoise4 = "pcellnoise4" / None;
    Fpnoise1 = "fpnoise1" / None;
    Fpnoise2 = "fpnoise2" / None;
    Fpnoise3 = "fpnoise3" / None;
    Fpnoise4 = "fpnoise4" / None;
    Cpnoise1 = "cpnoise1" / None;
    Cpnoise2 = "cpnoise2" / None;
    Cpnoise3 = "cpnoise3" / None;
    Cpnoise4 = "cpnoise4" / None;
    Ppnoise1 = "ppnoise1" / None;
    Ppnoise2 = "ppnoise2" / None;
    Ppnoise3 = "ppnoise3" / None;
    Ppnoise4 = "ppnoise4" / None;
    // Components.
    Xcomp = "xcomp" / None;
    Ycomp = "ycomp" / None;
    Zcomp = "zcomp" / None;
    Setxcomp = "setxcomp" / None;
    Setycomp = "setycomp" / None;
    Setzcomp = "setzcomp" / None;
    Comp = "comp" / None;
    Setcomp = "setcomp" / None;
    Mcomp = "mcomp" / None;
    Setmcomp = "setmcomp" / None;
    // Geometry.
    Length = "length" / None;
    Distance = "distance" / None;
    Ptlined = "ptlined" / None;
    Area = "area" / None;
    Normalize = "normalize" / None;
    Faceforward = "faceforward" / None;
    Faceforward2 = "faceforward2" / None;
    Reflect = "reflect" / None;
    Refract = "refract" / None;
    Fresnel = "fresnel" / None;
    Fresnel2 = "fresnel2" / None;
    Depth = "depth" / None;
    Calculatenormal = "calculatenormal" / None;
    Rotate = "rotate" / None;
    // Space transforms.
    Transform2 = "transform2" / None;
    Transform = "transform" / None;
    Transformm = "transformm" / None;
    Vtransform2 = "vtransform2" / None;
    Vtransform = "vtransform" / None;
    Vtransformm = "vtransformm" / None;
    Ntransform2 = "ntransform2" / None;
    Ntransform = "ntransform" / None;
    Ntransformm = "ntransformm" / None;
    Mtransform2 = "mtransform2" / None;
    Mtransform = "mtransform" / None;
    Ctransform2 = "ctransform2" / None;
    Ctransform = "ctransform" / None;
    // Matrix ops.
    Determinant = "determinant" / None;
    Mtranslate = "mtranslate" / None;
    Mrotate = "mrotate" / None;
    Mscale = "mscale" / None;
    // Mixes.
    Fmix = "fmix" / None;
    Cmix = "cmix" / None;
    Pmix = "pmix" / None;
    Vmix = "vmix" / None;
    Nmix = "nmix" / None;
    // Lighting.
    Ambient = "ambient" / None;
    Diffuse = "diffuse" / None;
    Specular = "specular" / None;
    Specularbrdf = "specularbrdf" / None;
    Phong = "phong" / None;
    Trace = "trace" / None;
    Shadow = "shadow" / None;
    Shadow1 = "shadow1" / None;
    Occlusion = "occlusion" / None;
    Illuminate = "illuminate" / None;
    Illuminate2 = "illuminate2" / None;
    InitIlluminance = "init_illuminance" / None;
    InitIlluminance2 = "init_illuminance2" / None;
    AdvanceIlluminance = "advance_illuminance" / None;
    Solar = "solar" / None;
    Solar2 = "solar2" / None;
    // Texturing.
    Ftexture1 = "ftexture1" / None;
    Ftexture2 = "ftexture2" / None;
    Ftexture3 = "ftexture3" / None;
    Ctexture1 = "ctexture1" / None;
    Ctexture2 = "ctexture2" / None;
    Ctexture3 = "ctexture3" / None;
    Fenvironment2 = "fenvironment2" / None;
    Fenvironment3 = "fenvironment3" / None;
    Cenvironment2 = "cenvironment2" / None;
    Cenvironment3 = "cenvironment3" / None;
    Bump1 = "bump1" / None;
    Bump2 = "bump2" / None;
    Bump3 = "bump3" / None;
    Textureinfo = "textureinfo" / None;
    // Renderer state.
    Atmosphere = "atmosphere" / None;
    Displacement = "displacement" / None;
    Lightsource = "lightsource" / None;
    Surface = "surface" / None;
    Attribute = "attribute" / None;
    Option = "option" / None;
    Rendererinfo = "rendererinfo" / None;
    Incident = "incident" / None;
    Opposite = "opposite" / None;
    Shadername = "shadername" / None;
    Shadername2 = "shadername2" / None;
    // Strings.
    Concat = "concat" / None;
    Format = "format" / None;
    Match = "match" / None;
    Printf = "printf" / None;
    // Point-cloud baking.
    BakeF = "bake_f" / None;
    Bake3c = "bake_3c" / None;
    Bake3p = "bake_3p" / None;
    Bake3v = "bake_3v" / None;
    Bake3n = "bake_3n" / None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonic_round_trip() {
        for op in [Op::Addff, Op::RsPush, Op::FDu, Op::InitIlluminance, Op::BakeF] {
            assert_eq!(Op::lookup(op.mnemonic()), Some(op));
        }
        assert_eq!(Op::lookup("no_such_op"), None);
    }

    #[test]
    fn operand_signatures() {
        assert_eq!(Op::Pushif.operands(), OperandSig::F1);
        assert_eq!(Op::Puship.operands(), OperandSig::F3);
        assert_eq!(Op::Pushis.operands(), OperandSig::Str);
        assert_eq!(Op::Pushv.operands(), OperandSig::Var);
        assert_eq!(Op::Jmp.operands(), OperandSig::Label);
        assert_eq!(Op::Addff.operands(), OperandSig::None);
    }

    #[test]
    fn var_id_system_bit() {
        let v = VarId::system(3);
        assert!(v.is_system());
        assert_eq!(v.index(), 3);
        let l = VarId::local(5);
        assert!(!l.is_system());
        assert_eq!(l.index(), 5);
    }
}

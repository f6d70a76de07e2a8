//! Runtime SPIR-V compiler selection.
//!
//! Shaders are specialized against the source video's colorimetry, so they
//! get compiled at runtime rather than baked in at build time. Two
//! backends are probed in order: the `shaderc` library (generally
//! preferred, but not packaged everywhere, hence the cargo feature) and a
//! `glslangValidator` subprocess for when all else fails.

use std::process::Command;

use log::{debug, error};

use super::error::Error;

/// GLSL version the renderer's shader sources are written against.
pub const GLSL_VERSION: u32 = 450;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Stage names as glslang spells them (`-S` argument).
    pub fn glslang_name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
            ShaderStage::Compute => "comp",
        }
    }

    #[cfg(feature = "shaderc")]
    fn shaderc_kind(self) -> shaderc::ShaderKind {
        match self {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
            ShaderStage::Compute => shaderc::ShaderKind::Compute,
        }
    }
}

pub trait SpirvCompiler {
    fn name(&self) -> &'static str;

    /// GLSL version the backend accepts.
    fn glsl_version(&self) -> u32;

    fn compile(&self, stage: ShaderStage, source: &str) -> Result<Vec<u32>, Error>;
}

/// Initializes the first usable compiler, in probe order. An explicit
/// `choice` (a compiler name) restricts the probe to that backend.
pub fn probe(choice: Option<&str>) -> Result<Box<dyn SpirvCompiler>, Error> {
    let mut candidates: Vec<Box<dyn SpirvCompiler>> = Vec::new();

    #[cfg(feature = "shaderc")]
    if let Some(compiler) = Shaderc::init() {
        candidates.push(Box::new(compiler));
    }
    if let Some(compiler) = GlslangSubprocess::init() {
        candidates.push(Box::new(compiler));
    }

    for compiler in candidates {
        if choice.is_some_and(|name| name != compiler.name()) {
            continue;
        }
        debug!("initializing SPIR-V compiler '{}'", compiler.name());
        return Ok(compiler);
    }

    error!("failed initializing a SPIR-V compiler");
    Err(Error::NoSpirvCompiler)
}

fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, Error> {
    if bytes.len() % 4 != 0 {
        return Err(Error::SpirvCompile(format!(
            "SPIR-V blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

#[cfg(feature = "shaderc")]
struct Shaderc {
    compiler: shaderc::Compiler,
}

#[cfg(feature = "shaderc")]
impl Shaderc {
    fn init() -> Option<Self> {
        Some(Self {
            compiler: shaderc::Compiler::new()?,
        })
    }
}

#[cfg(feature = "shaderc")]
impl SpirvCompiler for Shaderc {
    fn name(&self) -> &'static str {
        "shaderc"
    }

    fn glsl_version(&self) -> u32 {
        GLSL_VERSION
    }

    fn compile(&self, stage: ShaderStage, source: &str) -> Result<Vec<u32>, Error> {
        let mut options =
            shaderc::CompileOptions::new().ok_or(Error::NoSpirvCompiler)?;
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_1 as u32,
        );

        let artifact = self
            .compiler
            .compile_into_spirv(
                source,
                stage.shaderc_kind(),
                "shader.glsl",
                "main",
                Some(&options),
            )
            .map_err(|err| Error::SpirvCompile(err.to_string()))?;

        Ok(artifact.as_binary().to_vec())
    }
}

struct GlslangSubprocess;

impl GlslangSubprocess {
    fn init() -> Option<Self> {
        let available = Command::new("glslangValidator")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        available.then_some(Self)
    }
}

impl SpirvCompiler for GlslangSubprocess {
    fn name(&self) -> &'static str {
        "glslang-bin"
    }

    fn glsl_version(&self) -> u32 {
        // Detecting the real maximum per glslang build would be annoying;
        // 450 is what the shader sources target anyway.
        GLSL_VERSION
    }

    fn compile(&self, stage: ShaderStage, source: &str) -> Result<Vec<u32>, Error> {
        let scratch = tempfile::tempdir()?;
        let glsl_path = scratch
            .path()
            .join(format!("shader.{}", stage.glslang_name()));
        let spirv_path = scratch.path().join("shader.spv");

        std::fs::write(&glsl_path, source)?;

        let output = Command::new("glslangValidator")
            .arg("-V")
            .arg("-o")
            .arg(&spirv_path)
            .arg("-S")
            .arg(stage.glslang_name())
            .arg(&glsl_path)
            .output()?;

        if !output.status.success() {
            return Err(Error::SpirvCompile(
                String::from_utf8_lossy(&output.stdout).into_owned(),
            ));
        }

        let bytes = std::fs::read(&spirv_path).map_err(|_| {
            Error::SpirvCompile("glslang returned success but produced no SPIR-V".into())
        })?;
        words_from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_match_glslang() {
        assert_eq!(ShaderStage::Vertex.glslang_name(), "vert");
        assert_eq!(ShaderStage::Fragment.glslang_name(), "frag");
        assert_eq!(ShaderStage::Compute.glslang_name(), "comp");
    }

    #[test]
    fn compilers_report_glsl_version() {
        let glslang: Box<dyn SpirvCompiler> = Box::new(GlslangSubprocess);
        assert_eq!(glslang.glsl_version(), GLSL_VERSION);
    }

    #[test]
    fn spirv_words_decode_little_endian() {
        // The SPIR-V magic number, as it appears on disk.
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(words_from_bytes(&bytes).unwrap(), vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn truncated_spirv_is_rejected() {
        assert!(matches!(
            words_from_bytes(&[0x03, 0x02, 0x23]),
            Err(Error::SpirvCompile(_))
        ));
    }
}

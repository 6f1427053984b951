//! Raytracing shaders and the programs that group them.
//!
//! An [`RtProgram`] is a WGSL library plus a description of its exports: one
//! ray-generation shader, any number of miss shaders, and hit groups built from
//! closest-hit and any-hit shaders. The same program compiles on both capability
//! paths; [`RtProgram::link`] appends the library to a path-specific traversal
//! prelude and generates the glue that routes shader-table identifiers to the
//! library's functions.
//!
//! # Library Contract
//!
//! The library defines a `Payload` struct and the functions named by the program:
//!
//! ```text
//! fn <ray_generation>(pixel: vec2<u32>, dims: vec2<u32>)
//! fn <miss>(payload: ptr<function, Payload>, ray: Ray)
//! fn <closest_hit>(payload: ptr<function, Payload>, ray: Ray, hit: HitInfo)
//! fn <any_hit>(ray: Ray, hit: HitInfo) -> bool
//! ```
//!
//! The prelude provides `Ray`, `HitInfo`, `trace_ray(ray, miss_index, payload)`, and
//! shader-table accessors. Globals bound by the caller start at
//! `@group(0) @binding(4)`.
//!
//! # Example
//!
//! ```ignore
//! let program = RtProgram::new("scene", SCENE_LIBRARY)
//!     .with_ray_generation(RtShader::ray_generation("ray_generation"))
//!     .with_miss(RtShader::miss("miss"))
//!     .with_hit_group(HitGroup::new("hit_group").with_closest_hit(RtShader::closest_hit("closest_hit")))
//!     .with_max_recursion_depth(3);
//! ```

use std::fmt::Write;

/// Stage of a raytracing shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    RayGeneration,
    Miss,
    ClosestHit,
    AnyHit,
}

/// Local arguments a shader reads from its shader-table record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct LocalRootSignature {
    /// Bytes of local arguments following the shader identifier.
    pub size: u32,
}

/// One shader entry point of a program library.
#[derive(Clone, Debug, PartialEq)]
pub struct RtShader {
    pub kind: ShaderKind,
    pub entry_point: String,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub local_root_signature: Option<LocalRootSignature>,
}

impl RtShader {
    pub fn new(kind: ShaderKind, entry_point: impl Into<String>) -> Self {
        Self {
            kind,
            entry_point: entry_point.into(),
            max_payload_size: 16,
            max_attribute_size: 8,
            local_root_signature: None,
        }
    }

    pub fn ray_generation(entry_point: impl Into<String>) -> Self {
        Self::new(ShaderKind::RayGeneration, entry_point)
    }

    pub fn miss(entry_point: impl Into<String>) -> Self {
        Self::new(ShaderKind::Miss, entry_point)
    }

    pub fn closest_hit(entry_point: impl Into<String>) -> Self {
        Self::new(ShaderKind::ClosestHit, entry_point)
    }

    pub fn any_hit(entry_point: impl Into<String>) -> Self {
        Self::new(ShaderKind::AnyHit, entry_point)
    }

    pub fn with_payload_size(mut self, bytes: u32) -> Self {
        self.max_payload_size = bytes;
        self
    }

    pub fn with_attribute_size(mut self, bytes: u32) -> Self {
        self.max_attribute_size = bytes;
        self
    }

    /// Declares `bytes` of local arguments in this shader's records.
    pub fn with_local_arguments(mut self, bytes: u32) -> Self {
        self.local_root_signature = Some(LocalRootSignature { size: bytes });
        self
    }

    pub fn local_argument_size(&self) -> u32 {
        self.local_root_signature.map_or(0, |sig| sig.size)
    }
}

/// A named pair of intersection shaders, addressed by hit-group records.
#[derive(Clone, Debug, PartialEq)]
pub struct HitGroup {
    pub name: String,
    pub closest_hit: Option<RtShader>,
    pub any_hit: Option<RtShader>,
}

impl HitGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            closest_hit: None,
            any_hit: None,
        }
    }

    pub fn with_closest_hit(mut self, shader: RtShader) -> Self {
        self.closest_hit = Some(shader);
        self
    }

    pub fn with_any_hit(mut self, shader: RtShader) -> Self {
        self.any_hit = Some(shader);
        self
    }

    fn shaders(&self) -> impl Iterator<Item = &RtShader> {
        self.closest_hit.iter().chain(self.any_hit.iter())
    }
}

/// A library of raytracing shaders and the exports a state object is built from.
#[derive(Clone, Debug, PartialEq)]
pub struct RtProgram {
    pub label: String,
    /// WGSL source of the library.
    pub library: String,
    pub ray_generation: RtShader,
    pub misses: Vec<RtShader>,
    pub hit_groups: Vec<HitGroup>,
    pub max_recursion_depth: u32,
}

impl RtProgram {
    /// A program with a `ray_generation` entry and no miss shaders or hit groups.
    pub fn new(label: impl Into<String>, library: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            library: library.into(),
            ray_generation: RtShader::ray_generation("ray_generation"),
            misses: Vec::new(),
            hit_groups: Vec::new(),
            max_recursion_depth: 1,
        }
    }

    pub fn with_ray_generation(mut self, shader: RtShader) -> Self {
        self.ray_generation = shader;
        self
    }

    pub fn with_miss(mut self, shader: RtShader) -> Self {
        self.misses.push(shader);
        self
    }

    pub fn with_hit_group(mut self, group: HitGroup) -> Self {
        self.hit_groups.push(group);
        self
    }

    pub fn with_max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth.max(1);
        self
    }

    /// Export names in identifier order: ray generation, misses, then hit groups.
    pub fn exports(&self) -> Vec<&str> {
        std::iter::once(self.ray_generation.entry_point.as_str())
            .chain(self.misses.iter().map(|s| s.entry_point.as_str()))
            .chain(self.hit_groups.iter().map(|g| g.name.as_str()))
            .collect()
    }

    /// Position of `export` in [`RtProgram::exports`].
    pub fn export_index(&self, export: &str) -> Option<u32> {
        self.exports()
            .iter()
            .position(|name| *name == export)
            .map(|index| index as u32)
    }

    /// Largest payload declared by any shader.
    pub fn max_payload_size(&self) -> u32 {
        self.shaders()
            .map(|s| s.max_payload_size)
            .max()
            .unwrap_or(0)
    }

    pub fn max_attribute_size(&self) -> u32 {
        self.shaders()
            .map(|s| s.max_attribute_size)
            .max()
            .unwrap_or(0)
    }

    /// Largest local-argument block of any shader.
    pub fn max_local_argument_size(&self) -> u32 {
        self.shaders()
            .map(RtShader::local_argument_size)
            .max()
            .unwrap_or(0)
    }

    fn shaders(&self) -> impl Iterator<Item = &RtShader> {
        std::iter::once(&self.ray_generation)
            .chain(self.misses.iter())
            .chain(self.hit_groups.iter().flat_map(HitGroup::shaders))
    }

    /// Builds one compute module: `preludes`, the library, and generated glue.
    ///
    /// The glue defines the `entry_point` compute kernel (8x8 workgroups, one
    /// invocation per pixel) plus `dispatch_miss`, `dispatch_closest_hit`, and
    /// `dispatch_any_hit`, which switch on the identifier word of a shader record.
    /// Identifier values are `export index + 1`; zero is the null record.
    pub fn link(&self, preludes: &[&str], entry_point: &str) -> String {
        let mut source = String::new();
        for prelude in preludes {
            source.push_str(prelude);
            source.push('\n');
        }
        source.push_str(&self.library);
        source.push('\n');

        let miss_base = 1;
        let hit_base = miss_base + self.misses.len() as u32;

        // `write!` into a String cannot fail.
        let _ = writeln!(
            source,
            "fn dispatch_miss(identifier: u32, payload: ptr<function, Payload>, ray: Ray) {{\n    switch identifier {{"
        );
        for (i, miss) in self.misses.iter().enumerate() {
            let _ = writeln!(
                source,
                "        case {}u: {{ {}(payload, ray); }}",
                miss_base + i as u32 + 1,
                miss.entry_point
            );
        }
        let _ = writeln!(source, "        default: {{}}\n    }}\n}}\n");

        let _ = writeln!(
            source,
            "fn dispatch_closest_hit(identifier: u32, payload: ptr<function, Payload>, ray: Ray, hit: HitInfo) {{\n    switch identifier {{"
        );
        for (i, group) in self.hit_groups.iter().enumerate() {
            if let Some(shader) = &group.closest_hit {
                let _ = writeln!(
                    source,
                    "        case {}u: {{ {}(payload, ray, hit); }}",
                    hit_base + i as u32 + 1,
                    shader.entry_point
                );
            }
        }
        let _ = writeln!(source, "        default: {{}}\n    }}\n}}\n");

        let _ = writeln!(
            source,
            "fn dispatch_any_hit(identifier: u32, ray: Ray, hit: HitInfo) -> bool {{\n    var accepted = true;\n    switch identifier {{"
        );
        for (i, group) in self.hit_groups.iter().enumerate() {
            if let Some(shader) = &group.any_hit {
                let _ = writeln!(
                    source,
                    "        case {}u: {{ accepted = {}(ray, hit); }}",
                    hit_base + i as u32 + 1,
                    shader.entry_point
                );
            }
        }
        let _ = writeln!(
            source,
            "        default: {{}}\n    }}\n    return accepted;\n}}\n"
        );

        let _ = writeln!(
            source,
            "@compute @workgroup_size(8, 8, 1)\n\
             fn {entry_point}(@builtin(global_invocation_id) id: vec3<u32>) {{\n    \
             if id.x >= dispatch.width || id.y >= dispatch.height {{\n        return;\n    }}\n    \
             {}(id.xy, vec2<u32>(dispatch.width, dispatch.height));\n}}",
            self.ray_generation.entry_point
        );

        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> RtProgram {
        RtProgram::new("test", "// library")
            .with_ray_generation(RtShader::ray_generation("raygen"))
            .with_miss(RtShader::miss("miss_sky"))
            .with_miss(RtShader::miss("miss_shadow"))
            .with_hit_group(
                HitGroup::new("opaque")
                    .with_closest_hit(RtShader::closest_hit("shade").with_local_arguments(24)),
            )
            .with_hit_group(
                HitGroup::new("cutout")
                    .with_closest_hit(RtShader::closest_hit("shade"))
                    .with_any_hit(RtShader::any_hit("alpha_test").with_payload_size(32)),
            )
    }

    #[test]
    fn exports_are_ordered() {
        let program = program();
        assert_eq!(
            program.exports(),
            vec!["raygen", "miss_sky", "miss_shadow", "opaque", "cutout"]
        );
        assert_eq!(program.export_index("opaque"), Some(3));
        assert_eq!(program.export_index("missing"), None);
    }

    #[test]
    fn limits_cover_every_shader() {
        let program = program();
        assert_eq!(program.max_payload_size(), 32);
        assert_eq!(program.max_local_argument_size(), 24);
    }

    #[test]
    fn link_generates_dispatchers() {
        let source = program().link(&["// prelude"], "fallback_raytrace");

        assert!(source.starts_with("// prelude"));
        assert!(source.contains("case 2u: { miss_sky(payload, ray); }"));
        assert!(source.contains("case 3u: { miss_shadow(payload, ray); }"));
        assert!(source.contains("case 4u: { shade(payload, ray, hit); }"));
        assert!(source.contains("case 5u: { accepted = alpha_test(ray, hit); }"));
        assert!(source.contains("fn fallback_raytrace("));
        assert!(source.contains("raygen(id.xy"));
    }

    #[test]
    fn recursion_depth_is_at_least_one() {
        let program = RtProgram::new("p", "").with_max_recursion_depth(0);
        assert_eq!(program.max_recursion_depth, 1);
    }
}

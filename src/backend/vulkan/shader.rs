//! WGSL to SPIR-V compilation through naga.

use std::collections::HashMap;

use ash::vk;

use crate::backend::{BackendError, BackendResult, ShaderProgram};

/// Translate one entry point of a WGSL program to SPIR-V words.
pub fn compile_wgsl(program: &ShaderProgram, stage: naga::ShaderStage) -> BackendResult<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(program.source).map_err(|e| {
        BackendError::ShaderCompilationFailed(format!(
            "{}: WGSL parse error: {}",
            program.label,
            e.emit_to_string(program.source)
        ))
    })?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator.validate(&module).map_err(|e| {
        BackendError::ShaderCompilationFailed(format!("{}: validation error: {e}", program.label))
    })?;

    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == program.entry_point && ep.stage == stage)
    {
        return Err(BackendError::ShaderCompilationFailed(format!(
            "{}: entry point '{}' not found for stage {:?}",
            program.label, program.entry_point, stage
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: program.entry_point.to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options)).map_err(|e| {
        BackendError::ShaderCompilationFailed(format!(
            "{}: SPIR-V generation error: {e}",
            program.label
        ))
    })
}

/// Shader modules keyed by program label and entry point.
#[derive(Default)]
pub struct ShaderCache {
    modules: HashMap<(&'static str, &'static str), vk::ShaderModule>,
}

impl ShaderCache {
    pub fn get_or_create(
        &mut self,
        device: &ash::Device,
        program: &ShaderProgram,
        stage: naga::ShaderStage,
    ) -> BackendResult<vk::ShaderModule> {
        let key = (program.label, program.entry_point);
        if let Some(module) = self.modules.get(&key) {
            return Ok(*module);
        }

        let code = compile_wgsl(program, stage)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| {
            BackendError::ShaderCompilationFailed(format!(
                "{}: failed to create shader module: {e:?}",
                program.label
            ))
        })?;
        log::debug!(
            "Compiled shader {}::{} ({} words)",
            program.label,
            program.entry_point,
            code.len()
        );
        self.modules.insert(key, module);
        Ok(module)
    }

    /// # Safety
    /// No pipeline creation may be in flight.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for (_, module) in self.modules.drain() {
            device.destroy_shader_module(module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::shaders::{ASSIGN_LIGHTS, CLUSTERING_FS, FORWARD_VS};

    #[test]
    fn test_renderer_shaders_translate() {
        assert!(!compile_wgsl(&ASSIGN_LIGHTS, naga::ShaderStage::Compute).unwrap().is_empty());
        assert!(!compile_wgsl(&CLUSTERING_FS, naga::ShaderStage::Fragment).unwrap().is_empty());
        assert!(!compile_wgsl(&FORWARD_VS, naga::ShaderStage::Vertex).unwrap().is_empty());
    }

    #[test]
    fn test_missing_entry_point() {
        let program = ShaderProgram {
            entry_point: "does_not_exist",
            ..FORWARD_VS
        };
        assert!(matches!(
            compile_wgsl(&program, naga::ShaderStage::Vertex),
            Err(BackendError::ShaderCompilationFailed(_))
        ));
    }
}

//! GPU compute support for LUT mapping.
//!
//! A [`GpuDevice`] owns the wgpu device, queue and the trilinear mapping
//! pipeline. Tables are uploaded once per task as [`GpuTables`]; each stripe
//! is then mapped with one dispatch and read back as a float RGB stream.

use crate::lut::LookupTable;
use bytemuck::{Pod, Zeroable};
use log::{debug, info};
use thiserror::Error;
use wgpu::util::DeviceExt;

const SHADER_SOURCE: &str = include_str!("shaders/trilinear.wgsl");
const WORKGROUP_SIZE: u32 = 64;
const MAX_WORKGROUPS_PER_DIM: u32 = 65535;
const OUTPUT_BYTES_PER_PIXEL: u64 = 16;

/// Errors raised by the GPU layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpuError {
    /// No adapter matched the request.
    #[error("No suitable GPU adapter found")]
    NoAdapter,

    /// Device creation failed.
    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(String),

    /// A buffer could not be mapped or read back.
    #[error("GPU buffer operation failed: {0}")]
    Buffer(String),

    /// The stripe does not fit in a single storage binding.
    #[error("{pixels} pixels exceed the GPU binding limit of {limit} pixels")]
    TooLarge {
        /// Pixels in the stripe.
        pixels: usize,
        /// Most pixels one dispatch can hold.
        limit: usize,
    },
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct MapParams {
    pixel_count: u32,
    primary_size: u32,
    secondary_size: u32,
    row_pitch: u32,
    strength: f32,
    secondary_strength: f32,
    _pad0: f32,
    _pad1: f32,
}

/// Tables resident on the device for one task.
pub struct GpuTables {
    primary: wgpu::Buffer,
    secondary: wgpu::Buffer,
    primary_size: u32,
    secondary_size: u32,
}

impl GpuTables {
    /// Edge length of the uploaded primary table.
    pub fn primary_size(&self) -> u32 {
        self.primary_size
    }

    /// Edge length of the uploaded secondary table, 0 when absent.
    pub fn secondary_size(&self) -> u32 {
        self.secondary_size
    }
}

/// An initialized GPU with the mapping pipeline compiled.
pub struct GpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    adapter_info: wgpu::AdapterInfo,
    max_binding_size: u64,
}

impl GpuDevice {
    /// Initialize the device and compile the pipeline.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;

        let adapter_info = adapter.get_info();
        let adapter_limits = adapter.limits();
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_buffer_size: adapter_limits.max_buffer_size,
            ..wgpu::Limits::downlevel_defaults()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("lutforge-gpu"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| GpuError::DeviceRequest(e.to_string()))?;

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("trilinear_lut"),
            source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("lut_layout"),
            entries: &[
                storage(0, true),
                storage(1, true),
                storage(2, true),
                storage(3, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("lut_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("lut_pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        info!(
            "GPU initialized: {} ({:?}, {:?})",
            adapter_info.name, adapter_info.device_type, adapter_info.backend
        );

        Ok(Self {
            device,
            queue,
            pipeline,
            layout,
            adapter_info,
            max_binding_size: limits.max_storage_buffer_binding_size as u64,
        })
    }

    /// Adapter name, type and API.
    pub fn describe(&self) -> String {
        format!(
            "{} ({:?}, {:?})",
            self.adapter_info.name, self.adapter_info.device_type, self.adapter_info.backend
        )
    }

    /// Largest stripe a single dispatch can map.
    pub fn max_pixels_per_dispatch(&self) -> usize {
        (self.max_binding_size / OUTPUT_BYTES_PER_PIXEL) as usize
    }

    /// Upload the tables a task will use.
    pub fn upload_tables(&self, primary: &LookupTable, secondary: Option<&LookupTable>) -> GpuTables {
        let primary_buffer = self.table_buffer("lut_primary", &primary.to_rgba_f32());
        let (secondary_buffer, secondary_size) = match secondary {
            Some(table) => (
                self.table_buffer("lut_secondary", &table.to_rgba_f32()),
                table.size() as u32,
            ),
            // the binding must exist even when unused
            None => (self.table_buffer("lut_secondary_unused", &[0.0; 4]), 0),
        };
        GpuTables {
            primary: primary_buffer,
            secondary: secondary_buffer,
            primary_size: primary.size() as u32,
            secondary_size,
        }
    }

    fn table_buffer(&self, label: &str, cells: &[f32]) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(cells),
            usage: wgpu::BufferUsages::STORAGE,
        })
    }

    /// Map RGBA8 pixels in `src` into the float RGB stream `dst`.
    pub fn map_pixels(
        &self,
        tables: &GpuTables,
        strength: f32,
        secondary_strength: f32,
        src: &[u8],
        dst: &mut [f32],
    ) -> Result<(), GpuError> {
        let pixel_count = src.len() / 4;
        if pixel_count == 0 {
            return Ok(());
        }
        let limit = self.max_pixels_per_dispatch();
        if pixel_count > limit {
            return Err(GpuError::TooLarge {
                pixels: pixel_count,
                limit,
            });
        }

        let total_workgroups = (pixel_count as u32).div_ceil(WORKGROUP_SIZE);
        let (workgroups_x, workgroups_y) = if total_workgroups <= MAX_WORKGROUPS_PER_DIM {
            (total_workgroups, 1)
        } else {
            let side = ((total_workgroups as f64).sqrt().ceil() as u32).min(MAX_WORKGROUPS_PER_DIM);
            (side, total_workgroups.div_ceil(side).min(MAX_WORKGROUPS_PER_DIM))
        };

        let params = MapParams {
            pixel_count: pixel_count as u32,
            primary_size: tables.primary_size,
            secondary_size: tables.secondary_size,
            row_pitch: workgroups_x * WORKGROUP_SIZE,
            strength,
            secondary_strength,
            _pad0: 0.0,
            _pad1: 0.0,
        };

        let input = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("pixels_in"),
            contents: src,
            usage: wgpu::BufferUsages::STORAGE,
        });
        let output_size = pixel_count as u64 * OUTPUT_BYTES_PER_PIXEL;
        let output = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pixels_out"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let uniform = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("map_params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pixels_readback"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lut_bind_group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: tables.primary.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: tables.secondary.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: output.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: uniform.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("lut_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("lut_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups_x, workgroups_y, 1);
        }
        encoder.copy_buffer_to_buffer(&output, 0, &staging, 0, output_size);
        self.queue.submit(std::iter::once(encoder.finish()));

        debug!(
            "GPU dispatch: {} px in {}x{} workgroups",
            pixel_count, workgroups_x, workgroups_y
        );

        let slice = staging.slice(..);
        let (tx, rx) = crossbeam::channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| GpuError::Buffer(e.to_string()))?
            .map_err(|e| GpuError::Buffer(e.to_string()))?;

        {
            let data = slice.get_mapped_range();
            let texels: &[[f32; 4]] = bytemuck::cast_slice(&data);
            for (out, texel) in dst.chunks_exact_mut(3).zip(texels) {
                out.copy_from_slice(&texel[..3]);
            }
        }
        staging.unmap();
        Ok(())
    }
}

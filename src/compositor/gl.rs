//! glow/glutin implementation of `GpuBackend`.
//!
//! The context is headless: its base surface is a 1x1 pbuffer. The encoder target is an FBO read back through two PBOs in
//! ping-pong, so `present_encoder` never waits on the GPU for the frame it just drew; each frame
//! reaches the encoder one frame later. The preview target is a window surface.

use std::ffi::CStr;
use std::num::NonZeroU32;

use anyhow::{anyhow, Context as _, Result};
use glow::HasContext;
use glutin::config::{Config, ConfigSurfaceTypes, ConfigTemplateBuilder};
use glutin::context::{ContextApi, ContextAttributesBuilder, PossiblyCurrentContext, Version};
use glutin::display::{Display, DisplayApiPreference};
use glutin::prelude::*;
use glutin::surface::{PbufferSurface, Surface, SurfaceAttributesBuilder, SwapInterval, WindowSurface};
use image::RgbaImage;
use raw_window_handle::RawDisplayHandle;

use super::{GpuBackend, PreviewTarget, Target, Teardown, WATERMARK_QUAD};
use crate::camera::Transform;
use crate::encoder::InputSurface;
use crate::watermark::{WATERMARK_HEIGHT, WATERMARK_WIDTH};

const TAG: &str = "GL";

const CAMERA_VERT: &str = r#"#version 330 core
layout(location = 0) in vec2 a_pos;
layout(location = 1) in vec2 a_uv;
uniform mat4 u_tex_matrix;
out vec2 v_uv;
void main() {
    v_uv = (u_tex_matrix * vec4(a_uv, 0.0, 1.0)).xy;
    gl_Position = vec4(a_pos, 0.0, 1.0);
}"#;

const QUAD_VERT: &str = r#"#version 330 core
layout(location = 0) in vec2 a_pos;
layout(location = 1) in vec2 a_uv;
out vec2 v_uv;
void main() {
    v_uv = a_uv;
    gl_Position = vec4(a_pos, 0.0, 1.0);
}"#;

const TEXTURE_FRAG: &str = r#"#version 330 core
in vec2 v_uv;
uniform sampler2D u_tex;
out vec4 o_color;
void main() {
    o_color = texture(u_tex, v_uv);
}"#;

// x, y, u, v as a triangle strip.
const CAMERA_QUAD: [f32; 16] = [
    -1.0, -1.0, 0.0, 0.0, //
    1.0, -1.0, 1.0, 0.0, //
    -1.0, 1.0, 0.0, 1.0, //
    1.0, 1.0, 1.0, 1.0,
];

// Raster row 0 is the top of the text, and uploads land at v = 0: flip V.
fn watermark_quad() -> [f32; 16] {
    let [x, y, w, h] = WATERMARK_QUAD;
    [
        x, y, 0.0, 1.0, //
        x + w, y, 1.0, 1.0, //
        x, y + h, 0.0, 0.0, //
        x + w, y + h, 1.0, 0.0,
    ]
}

fn gl_err(what: &'static str) -> impl FnOnce(String) -> anyhow::Error {
    move |e| anyhow!("{what}: {e}")
}

fn nz(v: u32) -> NonZeroU32 {
    NonZeroU32::new(v).unwrap_or(NonZeroU32::MIN)
}

/// Display handle of the windowing system the GL context lives on.
#[derive(Clone, Copy)]
pub struct SendDisplay(pub RawDisplayHandle);

// SAFETY: a display connection handle is process-wide; it is only used to create the GL
// display on the render thread while the event loop that owns it is alive.
unsafe impl Send for SendDisplay {}
unsafe impl Sync for SendDisplay {}

impl std::fmt::Debug for SendDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SendDisplay(..)")
    }
}

struct Quad {
    vao: glow::NativeVertexArray,
    vbo: glow::NativeBuffer,
}

struct Programs {
    camera: glow::NativeProgram,
    camera_matrix: Option<glow::NativeUniformLocation>,
    quad: glow::NativeProgram,
    camera_quad: Quad,
    watermark_quad: Quad,
}

struct EncoderTarget {
    input: Box<dyn InputSurface>,
    fbo: glow::NativeFramebuffer,
    tex: glow::NativeTexture,
    w: i32,
    h: i32,
    pbos: [glow::NativeBuffer; 2],
    /// pts of the frame each PBO holds, if any.
    held: [Option<i64>; 2],
    write_index: usize,
    bytes: usize,
}

struct Preview {
    surface: Surface<WindowSurface>,
    w: u32,
    h: u32,
    // Dropped after `surface`.
    target: PreviewTarget,
}

pub struct GlBackend {
    raw_display: RawDisplayHandle,
    display: Option<Display>,
    config: Option<Config>,
    context: Option<PossiblyCurrentContext>,
    base_surface: Option<Surface<PbufferSurface>>,
    gl: Option<glow::Context>,
    programs: Option<Programs>,
    camera_tex: Option<glow::NativeTexture>,
    camera_size: (i32, i32),
    watermark_tex: Option<glow::NativeTexture>,
    encoder: Option<EncoderTarget>,
    preview: Option<Preview>,
}

impl GlBackend {
    pub fn new(display: SendDisplay) -> Self {
        Self {
            raw_display: display.0,
            display: None,
            config: None,
            context: None,
            base_surface: None,
            gl: None,
            programs: None,
            camera_tex: None,
            camera_size: (0, 0),
            watermark_tex: None,
            encoder: None,
            preview: None,
        }
    }

    fn gl(&self) -> Result<&glow::Context> {
        self.gl.as_ref().ok_or_else(|| anyhow!("GL context not created"))
    }

    fn create_context(&mut self) -> Result<()> {
        #[cfg(target_os = "macos")]
        let preference = DisplayApiPreference::Cgl;
        #[cfg(target_os = "windows")]
        let preference = DisplayApiPreference::Wgl(None);
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let preference = DisplayApiPreference::Egl;

        // SAFETY: the display handle comes from a live event loop (see `SendDisplay`).
        let display = unsafe { Display::new(self.raw_display, preference) }
            .context("create GL display")?;

        let template = |types: ConfigSurfaceTypes| {
            ConfigTemplateBuilder::new()
                .with_alpha_size(8)
                .with_depth_size(0)
                .with_surface_type(types)
                .build()
        };
        // SAFETY: `display` is valid for the duration of the call.
        let config = unsafe {
            display
                .find_configs(template(ConfigSurfaceTypes::WINDOW | ConfigSurfaceTypes::PBUFFER))
                .ok()
                .and_then(|mut c| c.next())
        }
        .ok_or_else(|| anyhow!("no GL config with window and pbuffer support"))?;

        let attrs = ContextAttributesBuilder::new()
            .with_context_api(ContextApi::OpenGl(Some(Version::new(3, 3))))
            .build(None);
        // SAFETY: config belongs to display.
        let not_current = unsafe { display.create_context(&config, &attrs) }
            .context("create GL 3.3 context")?;

        // The context always has a 1x1 pbuffer to be current on when no preview is bound.
        let pbuffer_attrs = SurfaceAttributesBuilder::<PbufferSurface>::new().build(nz(1), nz(1));
        // SAFETY: config belongs to display.
        let pbuffer = unsafe { display.create_pbuffer_surface(&config, &pbuffer_attrs) }
            .context("create 1x1 pbuffer")?;
        let context = not_current
            .make_current(&pbuffer)
            .context("make GL context current")?;

        // SAFETY: the context is current on this thread.
        let gl = unsafe {
            glow::Context::from_loader_function_cstr(|s: &CStr| display.get_proc_address(s).cast())
        };
        logd!(TAG, "context: {:?}", gl.version());

        self.base_surface = Some(pbuffer);
        self.context = Some(context);
        self.gl = Some(gl);
        self.config = Some(config);
        self.display = Some(display);
        Ok(())
    }

    fn make_base_current(&self) -> Result<()> {
        let ctx = self.context.as_ref().ok_or_else(|| anyhow!("no GL context"))?;
        let base = self.base_surface.as_ref().ok_or_else(|| anyhow!("no base surface"))?;
        ctx.make_current(base).context("make base surface current")
    }

    fn create_programs(&self) -> Result<Programs> {
        let gl = self.gl()?;
        unsafe {
            let camera = try_compile_program(gl, CAMERA_VERT, TEXTURE_FRAG).context("camera program")?;
            let quad = match try_compile_program(gl, QUAD_VERT, TEXTURE_FRAG) {
                Ok(p) => p,
                Err(e) => {
                    gl.delete_program(camera);
                    return Err(e.context("watermark program"));
                }
            };
            for p in [camera, quad] {
                gl.use_program(Some(p));
                let loc = gl.get_uniform_location(p, "u_tex");
                gl.uniform_1_i32(loc.as_ref(), 0);
            }
            gl.use_program(None);
            let camera_matrix = gl.get_uniform_location(camera, "u_tex_matrix");
            let camera_quad = create_quad(gl, &CAMERA_QUAD)?;
            let watermark_quad = create_quad(gl, &watermark_quad())?;
            Ok(Programs { camera, camera_matrix, quad, camera_quad, watermark_quad })
        }
    }

    fn create_encoder_target(&self, input: Box<dyn InputSurface>) -> Result<EncoderTarget> {
        let gl = self.gl()?;
        let (w, h) = (input.width() as i32, input.height() as i32);
        let bytes = w as usize * h as usize * 4;
        unsafe {
            let tex = create_texture(gl, w, h)?;
            let fbo = gl.create_framebuffer().map_err(gl_err("create framebuffer"))?;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(tex),
                0,
            );
            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            if status != glow::FRAMEBUFFER_COMPLETE {
                gl.delete_framebuffer(fbo);
                gl.delete_texture(tex);
                return Err(anyhow!("encoder FBO incomplete: 0x{status:x}"));
            }

            let pbo0 = gl.create_buffer().map_err(gl_err("create PBO"))?;
            let pbo1 = gl.create_buffer().map_err(gl_err("create PBO"))?;
            for pbo in [pbo0, pbo1] {
                gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Some(pbo));
                gl.buffer_data_size(glow::PIXEL_PACK_BUFFER, bytes as i32, glow::STREAM_READ);
            }
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);

            Ok(EncoderTarget {
                input,
                fbo,
                tex,
                w,
                h,
                pbos: [pbo0, pbo1],
                held: [None, None],
                write_index: 0,
                bytes,
            })
        }
    }

    fn delete_encoder_target(&mut self) {
        let (Some(gl), Some(t)) = (self.gl.as_ref(), self.encoder.take()) else {
            return;
        };
        unsafe {
            gl.delete_framebuffer(t.fbo);
            gl.delete_texture(t.tex);
            gl.delete_buffer(t.pbos[0]);
            gl.delete_buffer(t.pbos[1]);
        }
    }

    /// Map the PBO at `index` and queue its frame into the encoder input.
    fn queue_held(&mut self, index: usize) -> Result<()> {
        let (Some(gl), Some(t)) = (self.gl.as_ref(), self.encoder.as_mut()) else {
            return Ok(());
        };
        let Some(pts) = t.held[index].take() else {
            return Ok(());
        };
        unsafe {
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Some(t.pbos[index]));
            let ptr = gl.map_buffer_range(glow::PIXEL_PACK_BUFFER, 0, t.bytes as i32, glow::MAP_READ_BIT);
            let res = if ptr.is_null() {
                logw!(TAG, "PBO map failed; frame at {pts} us dropped");
                Ok(())
            } else {
                let frame = std::slice::from_raw_parts(ptr as *const u8, t.bytes);
                t.input.queue_frame(pts, frame)
            };
            gl.unmap_buffer(glow::PIXEL_PACK_BUFFER);
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
            res
        }
    }

    fn drop_preview(&mut self) -> Result<()> {
        if self.preview.is_some() {
            // Never destroy the surface the context is current on.
            self.make_base_current()?;
            self.preview = None;
        }
        Ok(())
    }
}

impl GpuBackend for GlBackend {
    type Preview = PreviewTarget;

    fn init(&mut self, input: Box<dyn InputSurface>, camera_w: u32, camera_h: u32) -> Result<u32> {
        self.create_context()?;
        self.programs = Some(self.create_programs()?);

        let (w, h) = (camera_w as i32, camera_h as i32);
        let tex = unsafe { create_texture(self.gl()?, w, h)? };
        self.camera_tex = Some(tex);
        self.camera_size = (w, h);

        self.encoder = Some(self.create_encoder_target(input)?);
        Ok(tex.0.get())
    }

    fn attach_encoder_input(&mut self, input: Box<dyn InputSurface>) -> Result<()> {
        self.delete_encoder_target();
        self.encoder = Some(self.create_encoder_target(input)?);
        Ok(())
    }

    fn upload_camera(&mut self, rgba: &[u8]) -> Result<()> {
        let gl = self.gl()?;
        let tex = self.camera_tex.ok_or_else(|| anyhow!("no camera texture"))?;
        let (w, h) = self.camera_size;
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(tex));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                0,
                0,
                w,
                h,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(Some(rgba)),
            );
            gl.bind_texture(glow::TEXTURE_2D, None);
        }
        Ok(())
    }

    fn bind(&mut self, target: Target) -> Result<()> {
        match target {
            Target::Encoder => {
                let gl = self.gl()?;
                let t = self.encoder.as_ref().ok_or_else(|| anyhow!("no encoder target"))?;
                unsafe {
                    gl.bind_framebuffer(glow::FRAMEBUFFER, Some(t.fbo));
                    gl.viewport(0, 0, t.w, t.h);
                }
            }
            Target::Preview => {
                let ctx = self.context.as_ref().ok_or_else(|| anyhow!("no GL context"))?;
                let p = self.preview.as_ref().ok_or_else(|| anyhow!("no preview surface"))?;
                ctx.make_current(&p.surface).context("make preview current")?;
                let gl = self.gl()?;
                unsafe {
                    gl.bind_framebuffer(glow::FRAMEBUFFER, None);
                    gl.viewport(0, 0, p.w as i32, p.h as i32);
                }
            }
        }
        Ok(())
    }

    fn draw_camera(&mut self, transform: &Transform) -> Result<()> {
        let gl = self.gl()?;
        let p = self.programs.as_ref().ok_or_else(|| anyhow!("no programs"))?;
        unsafe {
            gl.use_program(Some(p.camera));
            gl.uniform_matrix_4_f32_slice(p.camera_matrix.as_ref(), false, transform);
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(glow::TEXTURE_2D, self.camera_tex);
            gl.bind_vertex_array(Some(p.camera_quad.vao));
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
            gl.bind_vertex_array(None);
            gl.bind_texture(glow::TEXTURE_2D, None);
            gl.use_program(None);
        }
        Ok(())
    }

    fn create_watermark(&mut self) -> Result<()> {
        if self.watermark_tex.is_none() {
            let tex = unsafe { create_texture(self.gl()?, WATERMARK_WIDTH as i32, WATERMARK_HEIGHT as i32)? };
            self.watermark_tex = Some(tex);
        }
        Ok(())
    }

    fn upload_watermark(&mut self, raster: &RgbaImage) -> Result<()> {
        let gl = self.gl()?;
        let tex = self.watermark_tex.ok_or_else(|| anyhow!("no watermark texture"))?;
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(tex));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                0,
                0,
                raster.width() as i32,
                raster.height() as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(Some(raster.as_raw())),
            );
            gl.bind_texture(glow::TEXTURE_2D, None);
        }
        Ok(())
    }

    fn draw_watermark(&mut self) -> Result<()> {
        let gl = self.gl()?;
        let p = self.programs.as_ref().ok_or_else(|| anyhow!("no programs"))?;
        let tex = self.watermark_tex.ok_or_else(|| anyhow!("no watermark texture"))?;
        unsafe {
            gl.enable(glow::BLEND);
            gl.blend_func(glow::SRC_ALPHA, glow::ONE_MINUS_SRC_ALPHA);
            gl.use_program(Some(p.quad));
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(glow::TEXTURE_2D, Some(tex));
            gl.bind_vertex_array(Some(p.watermark_quad.vao));
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
            gl.bind_vertex_array(None);
            gl.bind_texture(glow::TEXTURE_2D, None);
            gl.use_program(None);
            gl.disable(glow::BLEND);
        }
        Ok(())
    }

    fn present_encoder(&mut self, pts_us: i64) -> Result<()> {
        let gl = self.gl.as_ref().ok_or_else(|| anyhow!("GL context not created"))?;
        let t = self.encoder.as_mut().ok_or_else(|| anyhow!("no encoder target"))?;
        let write = t.write_index;
        unsafe {
            // GPU -> PBO; the copy completes asynchronously.
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(t.fbo));
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Some(t.pbos[write]));
            gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            gl.read_pixels(
                0,
                0,
                t.w,
                t.h,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::BufferOffset(0),
            );
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
        }
        t.held[write] = Some(pts_us);
        let read = write ^ 1;
        t.write_index = read;
        self.queue_held(read)
    }

    fn flush_encoder(&mut self) -> Result<()> {
        let Some(t) = self.encoder.as_ref() else {
            return Ok(());
        };
        // The slot about to be written is the older one; the other holds the newest frame.
        let (older, newest) = (t.write_index, t.write_index ^ 1);
        self.queue_held(older)?;
        self.queue_held(newest)
    }

    fn set_preview(&mut self, preview: Option<PreviewTarget>) -> Result<()> {
        let Some(target) = preview else {
            return self.drop_preview();
        };
        {
            let ctx = self.context.as_ref().ok_or_else(|| anyhow!("no GL context"))?;
            if let Some(current) = self.preview.as_mut() {
                if current.target.handle == target.handle {
                    current.surface.resize(ctx, nz(target.width), nz(target.height));
                    current.w = target.width.max(1);
                    current.h = target.height.max(1);
                    return Ok(());
                }
            }
        }
        self.drop_preview()?;

        let (display, config, ctx) = match (self.display.as_ref(), self.config.as_ref(), self.context.as_ref()) {
            (Some(d), Some(c), Some(ctx)) => (d, c, ctx),
            _ => return Err(anyhow!("no GL display")),
        };
        let attrs = SurfaceAttributesBuilder::<WindowSurface>::new().build(
            target.handle,
            nz(target.width),
            nz(target.height),
        );
        // SAFETY: `target.owner` keeps the native window alive while the surface exists.
        let surface = unsafe { display.create_window_surface(config, &attrs) }
            .context("create preview surface")?;
        ctx.make_current(&surface).context("make preview current")?;
        if let Err(e) = surface.set_swap_interval(ctx, SwapInterval::DontWait) {
            logd!(TAG, "swap interval not set: {e}");
        }
        self.preview = Some(Preview {
            surface,
            w: target.width.max(1),
            h: target.height.max(1),
            target,
        });
        self.make_base_current()
    }

    fn present_preview(&mut self) -> Result<()> {
        let ctx = self.context.as_ref().ok_or_else(|| anyhow!("no GL context"))?;
        let p = self.preview.as_ref().ok_or_else(|| anyhow!("no preview surface"))?;
        p.surface.swap_buffers(ctx).context("preview swap")?;
        self.make_base_current()
    }

    fn release(&mut self, stage: Teardown) {
        match stage {
            Teardown::Programs => {
                if let (Some(gl), Some(p)) = (self.gl.as_ref(), self.programs.take()) {
                    unsafe {
                        gl.delete_program(p.camera);
                        gl.delete_program(p.quad);
                        for q in [p.camera_quad, p.watermark_quad] {
                            gl.delete_vertex_array(q.vao);
                            gl.delete_buffer(q.vbo);
                        }
                    }
                }
            }
            Teardown::Textures => {
                if let (Some(gl), Some(t)) = (self.gl.as_ref(), self.camera_tex.take()) {
                    unsafe { gl.delete_texture(t) };
                }
            }
            Teardown::Watermark => {
                if let (Some(gl), Some(t)) = (self.gl.as_ref(), self.watermark_tex.take()) {
                    unsafe { gl.delete_texture(t) };
                }
            }
            Teardown::Targets => {
                self.delete_encoder_target();
                if let Err(e) = self.drop_preview() {
                    logw!(TAG, "preview release: {e:#}");
                    self.preview = None;
                }
                self.base_surface = None;
            }
            Teardown::Context => {
                self.gl = None;
                self.context = None;
                self.config = None;
            }
            Teardown::Display => {
                self.display = None;
            }
        }
    }
}

unsafe fn create_texture(gl: &glow::Context, w: i32, h: i32) -> Result<glow::NativeTexture> {
    let tex = gl.create_texture().map_err(gl_err("create texture"))?;
    gl.bind_texture(glow::TEXTURE_2D, Some(tex));
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
    gl.tex_image_2d(
        glow::TEXTURE_2D,
        0,
        glow::RGBA as i32,
        w,
        h,
        0,
        glow::RGBA,
        glow::UNSIGNED_BYTE,
        glow::PixelUnpackData::Slice(None),
    );
    gl.bind_texture(glow::TEXTURE_2D, None);
    Ok(tex)
}

unsafe fn create_quad(gl: &glow::Context, verts: &[f32; 16]) -> Result<Quad> {
    let bytes: Vec<u8> = verts.iter().flat_map(|f| f.to_ne_bytes()).collect();
    let vao = gl.create_vertex_array().map_err(gl_err("create vertex array"))?;
    let vbo = gl.create_buffer().map_err(gl_err("create vertex buffer"))?;
    gl.bind_vertex_array(Some(vao));
    gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
    gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, &bytes, glow::STATIC_DRAW);
    let stride = 4 * std::mem::size_of::<f32>() as i32;
    gl.enable_vertex_attrib_array(0);
    gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, stride, 0);
    gl.enable_vertex_attrib_array(1);
    gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, stride, 2 * std::mem::size_of::<f32>() as i32);
    gl.bind_vertex_array(None);
    gl.bind_buffer(glow::ARRAY_BUFFER, None);
    Ok(Quad { vao, vbo })
}

unsafe fn try_compile_program(gl: &glow::Context, vert_src: &str, frag_src: &str) -> Result<glow::NativeProgram> {
    let vs = gl.create_shader(glow::VERTEX_SHADER).map_err(gl_err("create vertex shader"))?;
    gl.shader_source(vs, vert_src);
    gl.compile_shader(vs);
    if !gl.get_shader_compile_status(vs) {
        let log = gl.get_shader_info_log(vs);
        gl.delete_shader(vs);
        return Err(anyhow!("vertex shader compile error:\n{log}"));
    }

    let fs = gl.create_shader(glow::FRAGMENT_SHADER).map_err(gl_err("create fragment shader"))?;
    gl.shader_source(fs, frag_src);
    gl.compile_shader(fs);
    if !gl.get_shader_compile_status(fs) {
        let log = gl.get_shader_info_log(fs);
        gl.delete_shader(vs);
        gl.delete_shader(fs);
        return Err(anyhow!("fragment shader compile error:\n{log}"));
    }

    let program = gl.create_program().map_err(gl_err("create program"))?;
    gl.attach_shader(program, vs);
    gl.attach_shader(program, fs);
    gl.link_program(program);
    let linked = gl.get_program_link_status(program);
    let log = if linked { String::new() } else { gl.get_program_info_log(program) };

    gl.detach_shader(program, vs);
    gl.detach_shader(program, fs);
    gl.delete_shader(vs);
    gl.delete_shader(fs);
    if !linked {
        gl.delete_program(program);
        return Err(anyhow!("program link error:\n{log}"));
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_quad_sits_top_left_with_flipped_v() {
        let q = watermark_quad();
        // bottom-left vertex
        assert_eq!(&q[0..4], &[-0.95, 0.85, 0.0, 1.0]);
        // top-right vertex stays inside clip space
        assert!((q[12] - -0.45).abs() < 1e-6);
        assert!(q[13] <= 1.0 && (q[13] - 0.93).abs() < 1e-6);
        assert_eq!(q[15], 0.0);
    }

    fn unopened_backend() -> GlBackend {
        use raw_window_handle::{RawDisplayHandle, XlibDisplayHandle};
        GlBackend::new(SendDisplay(RawDisplayHandle::Xlib(XlibDisplayHandle::empty())))
    }

    #[test]
    fn preview_calls_before_init_fail_without_touching_gl() {
        use raw_window_handle::{RawWindowHandle, XlibWindowHandle};
        let mut b = unopened_backend();
        // dropping a preview that was never bound is a no-op
        assert!(b.set_preview(None).is_ok());
        let target = PreviewTarget {
            handle: RawWindowHandle::Xlib(XlibWindowHandle::empty()),
            width: 4,
            height: 4,
            owner: None,
        };
        let err = b.set_preview(Some(target)).unwrap_err();
        assert!(err.to_string().contains("no GL context"), "{err}");
        assert!(b.preview.is_none());
        assert!(b.present_preview().is_err());
    }

    #[test]
    fn base_surface_is_required_to_be_current() {
        let b = unopened_backend();
        assert!(b.make_base_current().is_err());
        assert!(b.base_surface.is_none());
    }

    #[test]
    fn camera_quad_covers_clip_space() {
        let xs: Vec<f32> = CAMERA_QUAD.chunks(4).map(|v| v[0]).collect();
        let ys: Vec<f32> = CAMERA_QUAD.chunks(4).map(|v| v[1]).collect();
        assert_eq!(xs, vec![-1.0, 1.0, -1.0, 1.0]);
        assert_eq!(ys, vec![-1.0, -1.0, 1.0, 1.0]);
    }
}

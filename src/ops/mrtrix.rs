//! Command-line tool backend
//!
//! Runs MRtrix3 (`dwi2response`, `dwi2fod`, `mtnormalise`, `dwi2mask`,
//! `mrthreshold`), FSL `bet`, `hd-bet` and `mri_synthstrip` inside the run's
//! scratch directory. Images are exchanged as NIfTI files, responses and
//! balance factors as text tables, gradients as FSL bvecs/bvals.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use super::{ExternalOperations, HdBetDevice, JointNormalisation, ToolResult};
use crate::config::{BetOptions, LmaxSchedule, RunContext, SynthStripOptions};
use crate::error::ToolError;
use crate::nifti_io;
use crate::tables;
use crate::volume::{BrainMask, DwiVolume, FodVolume, ScalarVolume, Tissue, TissueResponse};

const RESPONSE_TISSUES: [Tissue; 3] = [Tissue::WhiteMatter, Tissue::GreyMatter, Tissue::Csf];

/// Lines of stderr kept in a failure report
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolKind {
    /// Accepts the MRtrix3 common options (-nthreads, -quiet, -force)
    Mrtrix,
    Other,
}

/// [`ExternalOperations`] backed by the command-line tools
#[derive(Debug, Clone)]
pub struct MrtrixOperations {
    invocation: usize,
    response_algorithm: String,
}

impl Default for MrtrixOperations {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a staging failure (file I/O around a tool call) into a tool error
fn staged<T>(tool: &str, result: crate::error::Result<T>) -> ToolResult<T> {
    result.map_err(|e| ToolError::new(tool, e.to_string()))
}

impl MrtrixOperations {
    pub fn new() -> Self {
        Self {
            invocation: 0,
            response_algorithm: "dhollander".to_string(),
        }
    }

    /// Algorithm used by `dwi2response`
    pub fn with_response_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.response_algorithm = algorithm.into();
        self
    }

    /// Unique file stem for the next invocation
    fn next_stem(&mut self, tool: &str) -> String {
        self.invocation += 1;
        format!("{:03}_{}", self.invocation, tool)
    }

    fn build_command(ctx: &RunContext, program: &str, args: &[OsString], kind: ToolKind) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&ctx.scratch_dir);
        match kind {
            ToolKind::Mrtrix => {
                cmd.args(["-quiet", "-force"]);
                if let Some(n) = ctx.nthreads {
                    cmd.arg("-nthreads").arg(n.to_string());
                }
            }
            ToolKind::Other => {
                cmd.env("FSLOUTPUTTYPE", "NIFTI_GZ");
            }
        }
        cmd
    }

    fn run(&self, ctx: &RunContext, program: &str, args: &[OsString], kind: ToolKind) -> ToolResult<()> {
        let mut cmd = Self::build_command(ctx, program, args, kind);
        debug!(command = ?cmd, "running external tool");

        let output = cmd
            .output()
            .map_err(|e| ToolError::new(program, format!("failed to launch: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n");
            return Err(ToolError::new(program, format!("{}: {}", output.status, tail)));
        }
        Ok(())
    }

    fn stage_dwi(&self, ctx: &RunContext, stem: &str, tool: &str, dwi: &DwiVolume) -> ToolResult<Vec<OsString>> {
        let image = ctx.scratch_path(format!("{}_dwi.nii", stem));
        let bvecs = ctx.scratch_path(format!("{}_bvecs", stem));
        let bvals = ctx.scratch_path(format!("{}_bvals", stem));
        staged(tool, nifti_io::write_dwi(&image, dwi))?;
        staged(tool, tables::write_fsl_gradients(&bvecs, &bvals, dwi.gradients()))?;
        Ok(vec![image.into(), "-fslgrad".into(), bvecs.into(), bvals.into()])
    }

    fn stage_mask(&self, ctx: &RunContext, stem: &str, tool: &str, mask: &BrainMask) -> ToolResult<PathBuf> {
        let path = ctx.scratch_path(format!("{}_mask_in.nii", stem));
        staged(tool, nifti_io::write_mask(&path, mask))?;
        Ok(path)
    }

    fn stage_image(&self, ctx: &RunContext, stem: &str, tool: &str, image: &ScalarVolume) -> ToolResult<PathBuf> {
        let path = ctx.scratch_path(format!("{}_input.nii.gz", stem));
        staged(tool, nifti_io::write_scalar(&path, image))?;
        Ok(path)
    }
}

fn response_for(responses: &[TissueResponse], tissue: Tissue) -> ToolResult<&TissueResponse> {
    responses
        .iter()
        .find(|r| r.tissue == tissue)
        .ok_or_else(|| ToolError::new("dwi2fod", format!("no {} response supplied", tissue.short_name())))
}

fn arg(path: &Path) -> OsString {
    path.as_os_str().to_owned()
}

impl ExternalOperations for MrtrixOperations {
    fn dwi2mask(&mut self, ctx: &RunContext, dwi: &DwiVolume, algorithm: &str) -> ToolResult<BrainMask> {
        let tool = "dwi2mask";
        let stem = self.next_stem(tool);
        let mut dwi_args = self.stage_dwi(ctx, &stem, tool, dwi)?;
        let out = ctx.scratch_path(format!("{}_mask.nii", stem));

        let mut args: Vec<OsString> = vec![algorithm.into(), dwi_args.remove(0), arg(&out)];
        args.extend(dwi_args);
        self.run(ctx, tool, &args, ToolKind::Mrtrix)?;
        staged(tool, nifti_io::read_mask(&out))
    }

    fn estimate_responses(
        &mut self,
        ctx: &RunContext,
        dwi: &DwiVolume,
        mask: &BrainMask,
    ) -> ToolResult<Vec<TissueResponse>> {
        let tool = "dwi2response";
        let stem = self.next_stem(tool);
        // TODO: stage the DWI once per iteration and share it with dwi2fod
        let mut dwi_args = self.stage_dwi(ctx, &stem, tool, dwi)?;
        let mask_path = self.stage_mask(ctx, &stem, tool, mask)?;
        let outputs: Vec<PathBuf> = RESPONSE_TISSUES
            .iter()
            .map(|t| ctx.scratch_path(format!("{}_{}.txt", stem, t.short_name())))
            .collect();

        let mut args: Vec<OsString> = vec![self.response_algorithm.as_str().into(), dwi_args.remove(0)];
        args.extend(outputs.iter().map(|p| arg(p)));
        args.extend(dwi_args);
        args.extend(["-mask".into(), arg(&mask_path)]);
        self.run(ctx, tool, &args, ToolKind::Mrtrix)?;

        RESPONSE_TISSUES
            .iter()
            .zip(&outputs)
            .map(|(&tissue, path)| staged(tool, tables::read_response(path, tissue)))
            .collect()
    }

    fn estimate_fods(
        &mut self,
        ctx: &RunContext,
        dwi: &DwiVolume,
        mask: &BrainMask,
        responses: &[TissueResponse],
        lmax: &LmaxSchedule,
    ) -> ToolResult<Vec<FodVolume>> {
        let tool = "dwi2fod";
        let stem = self.next_stem(tool);
        let tissues = Tissue::for_schedule_len(lmax.len());
        let mut dwi_args = self.stage_dwi(ctx, &stem, tool, dwi)?;
        let mask_path = self.stage_mask(ctx, &stem, tool, mask)?;

        let mut args: Vec<OsString> = vec!["msmt_csd".into(), dwi_args.remove(0)];
        let mut fod_paths = Vec::with_capacity(tissues.len());
        for &tissue in tissues {
            let rf_path = ctx.scratch_path(format!("{}_{}_rf.txt", stem, tissue.short_name()));
            let fod_path = ctx.scratch_path(format!("{}_{}_fod.nii", stem, tissue.short_name()));
            staged(tool, tables::write_response(&rf_path, response_for(responses, tissue)?))?;
            args.push(arg(&rf_path));
            args.push(arg(&fod_path));
            fod_paths.push((tissue, fod_path));
        }
        args.extend(dwi_args);
        args.extend(["-mask".into(), arg(&mask_path), "-lmax".into(), lmax.to_string().into()]);
        self.run(ctx, tool, &args, ToolKind::Mrtrix)?;

        fod_paths
            .iter()
            .map(|(tissue, path)| staged(tool, nifti_io::read_fod(path, *tissue)))
            .collect()
    }

    fn joint_normalise(
        &mut self,
        ctx: &RunContext,
        fods: &[FodVolume],
        mask: &BrainMask,
    ) -> ToolResult<JointNormalisation> {
        let tool = "mtnormalise";
        let stem = self.next_stem(tool);
        let mask_path = self.stage_mask(ctx, &stem, tool, mask)?;
        let field_path = ctx.scratch_path(format!("{}_field.nii", stem));
        let factors_path = ctx.scratch_path(format!("{}_factors.txt", stem));

        let mut args: Vec<OsString> = Vec::new();
        let mut outputs = Vec::with_capacity(fods.len());
        for fod in fods {
            let name = fod.tissue().short_name();
            let input = ctx.scratch_path(format!("{}_{}_fod.nii", stem, name));
            let output = ctx.scratch_path(format!("{}_{}_norm.nii", stem, name));
            staged(tool, nifti_io::write_fod(&input, fod))?;
            args.push(arg(&input));
            args.push(arg(&output));
            outputs.push((fod.tissue(), output));
        }
        args.extend([
            "-mask".into(),
            arg(&mask_path),
            "-check_norm".into(),
            arg(&field_path),
            "-check_factors".into(),
            arg(&factors_path),
        ]);
        self.run(ctx, tool, &args, ToolKind::Mrtrix)?;

        let tissues: Vec<Tissue> = fods.iter().map(|f| f.tissue()).collect();
        let normalised = outputs
            .iter()
            .map(|(tissue, path)| staged(tool, nifti_io::read_fod(path, *tissue)))
            .collect::<ToolResult<Vec<_>>>()?;
        Ok(JointNormalisation {
            bias_field: staged(tool, nifti_io::read_scalar(&field_path))?,
            balance: staged(tool, tables::read_balance_factors(&factors_path, &tissues))?,
            normalised,
        })
    }

    fn bet(&mut self, ctx: &RunContext, image: &ScalarVolume, options: &BetOptions) -> ToolResult<BrainMask> {
        let tool = "bet";
        let stem = self.next_stem(tool);
        let input = self.stage_image(ctx, &stem, tool, image)?;
        let out_base = ctx.scratch_path(format!("{}_brain", stem));

        let mut args: Vec<OsString> = vec![
            arg(&input),
            arg(&out_base),
            "-m".into(),
            "-f".into(),
            options.fractional_intensity.to_string().into(),
        ];
        if options.robust {
            args.push("-R".into());
        }
        self.run(ctx, tool, &args, ToolKind::Other)?;
        staged(tool, nifti_io::read_mask(&ctx.scratch_path(format!("{}_brain_mask.nii.gz", stem))))
    }

    fn hdbet(&mut self, ctx: &RunContext, image: &ScalarVolume, device: HdBetDevice) -> ToolResult<BrainMask> {
        let tool = "hd-bet";
        let stem = self.next_stem("hdbet");
        let input = self.stage_image(ctx, &stem, tool, image)?;
        let output = ctx.scratch_path(format!("{}_brain.nii.gz", stem));

        let mut args: Vec<OsString> = vec!["-i".into(), arg(&input), "-o".into(), arg(&output)];
        if device == HdBetDevice::CpuFast {
            args.extend(["-device", "cpu", "-mode", "fast", "-tta", "0"].map(OsString::from));
        }
        self.run(ctx, tool, &args, ToolKind::Other)?;
        staged(tool, nifti_io::read_mask(&ctx.scratch_path(format!("{}_brain_mask.nii.gz", stem))))
    }

    fn synthstrip(
        &mut self,
        ctx: &RunContext,
        image: &ScalarVolume,
        options: &SynthStripOptions,
    ) -> ToolResult<BrainMask> {
        let tool = "mri_synthstrip";
        let stem = self.next_stem("synthstrip");
        let input = self.stage_image(ctx, &stem, tool, image)?;
        let mask_path = ctx.scratch_path(format!("{}_mask.nii.gz", stem));

        let mut args: Vec<OsString> = vec!["-i".into(), arg(&input), "-m".into(), arg(&mask_path)];
        if let Some(border) = options.border {
            args.extend([OsString::from("-b"), OsString::from(border.to_string())]);
        }
        if options.gpu {
            args.push("-g".into());
        }
        if let Some(n) = ctx.nthreads {
            args.extend([OsString::from("-n"), OsString::from(n.to_string())]);
        }
        self.run(ctx, tool, &args, ToolKind::Other)?;
        staged(tool, nifti_io::read_mask(&mask_path))
    }

    fn mrthreshold(&mut self, ctx: &RunContext, image: &ScalarVolume) -> ToolResult<BrainMask> {
        let tool = "mrthreshold";
        let stem = self.next_stem(tool);
        let input = self.stage_image(ctx, &stem, tool, image)?;
        let output = ctx.scratch_path(format!("{}_mask.nii", stem));

        self.run(ctx, tool, &[arg(&input), arg(&output)], ToolKind::Mrtrix)?;
        staged(tool, nifti_io::read_mask(&output))
    }
}

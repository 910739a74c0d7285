/*
 * Gaia - greenhouse automation engine
 * Copyright (c) 2023-2026  Gaia Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::path::Path;
use std::process::Stdio;
use std::rc::Rc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::errors::GaiaError;
use crate::hardware::{Camera, Hardware, HardwareDriver, HardwareMetadata};

const CAPTURE_WIDTH: u32 = 320;
const CAPTURE_HEIGHT: u32 = 240;

/// One pixel, with the near-infrared channel NoIR camera modules provide.
/// Channels are normalized to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pixel {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub nir: f64,
}

/// A raw captured frame, the input of the plant health indices.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Pixel>,
}

impl PixelFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<Pixel>) -> Self {
        debug_assert_eq!(pixels.len(), (width * height) as usize);
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// The Raspberry Pi camera, captured through the `rpicam` CLI stack as a
/// raw RGB dump.
pub struct PiCamera {
    metadata: HardwareMetadata,
}

impl PiCamera {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self { metadata }))
    }
}

impl Hardware for PiCamera {
    fn metadata(&self) -> &HardwareMetadata {
        &self.metadata
    }

    fn as_camera(&self) -> Option<&dyn Camera> {
        Some(self)
    }
}

#[async_trait(?Send)]
impl Camera for PiCamera {
    async fn capture(&self) -> Result<PixelFrame> {
        if !Path::new("/usr/bin/rpicam-still").exists() {
            return Err(GaiaError::TransientHardwareFailure {
                msg: format!(
                    "Camera '{}' needs the rpicam stack, which is not installed",
                    self.metadata.name
                ),
            }
            .into());
        }
        let output = tokio::process::Command::new("/usr/bin/rpicam-still")
            .args([
                "--encoding",
                "rgb",
                "--width",
                &CAPTURE_WIDTH.to_string(),
                "--height",
                &CAPTURE_HEIGHT.to_string(),
                "--nopreview",
                "--output",
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .with_context(|| "Spawning rpicam-still")?;
        if !output.status.success() {
            return Err(GaiaError::TransientHardwareFailure {
                msg: format!("rpicam-still exited with {}", output.status),
            }
            .into());
        }
        Ok(frame_from_rgb(&output.stdout, CAPTURE_WIDTH, CAPTURE_HEIGHT)?)
    }
}

fn frame_from_rgb(data: &[u8], width: u32, height: u32) -> Result<PixelFrame> {
    let expected = (width * height * 3) as usize;
    if data.len() < expected {
        return Err(GaiaError::TransientHardwareFailure {
            msg: format!(
                "Truncated camera frame: got {} bytes, expected {expected}",
                data.len()
            ),
        }
        .into());
    }
    let pixels = data[..expected]
        .chunks_exact(3)
        .map(|rgb| Pixel {
            r: f64::from(rgb[0]) / 255.0,
            g: f64::from(rgb[1]) / 255.0,
            b: f64::from(rgb[2]) / 255.0,
            // standard modules carry no IR filter data
            nir: 0.0,
        })
        .collect();
    Ok(PixelFrame::new(width, height, pixels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_from_rgb_bytes() {
        let data = vec![255u8, 0, 0, 0, 255, 0];
        let frame = frame_from_rgb(&data, 2, 1).unwrap();
        assert_eq!(frame.pixels.len(), 2);
        assert_eq!(frame.pixels[0].r, 1.0);
        assert_eq!(frame.pixels[1].g, 1.0);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(frame_from_rgb(&[1, 2, 3], 2, 2).is_err());
    }
}

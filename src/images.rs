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

//! Plant health indices: per-pixel channel formulas averaged over a frame.

use anyhow::{anyhow, Result};
use strum::{Display, EnumIter, EnumString};

use crate::hardware::camera::{Pixel, PixelFrame};

/// The vegetation indices the health subroutine can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum HealthIndex {
    Mpri,
    Ndrgi,
    Ndvi,
    Vari,
}

impl HealthIndex {
    pub fn formula(self) -> &'static str {
        match self {
            // Yang, Willis & Mueller 2008
            HealthIndex::Mpri => "(g-r)/(g+r)",
            HealthIndex::Ndrgi => "(r-g)/(g+r)",
            HealthIndex::Ndvi => "(nir-r)/(nir+r)",
            HealthIndex::Vari => "(g-r)/(g+r-b)",
        }
    }
}

/// Evaluates a channel formula for every pixel and returns the mean.
///
/// Pixels whose denominator vanishes are skipped. Returns an error for an
/// unknown formula or a frame with no evaluable pixel.
pub fn image_mean_of_formula(frame: &PixelFrame, formula: &str) -> Result<f64> {
    let per_pixel: fn(&Pixel) -> (f64, f64) = match formula {
        "(g-r)/(g+r)" => |p| (p.g - p.r, p.g + p.r),
        "(r-g)/(g+r)" => |p| (p.r - p.g, p.g + p.r),
        "(nir-r)/(nir+r)" => |p| (p.nir - p.r, p.nir + p.r),
        "(g-r)/(g+r-b)" => |p| (p.g - p.r, p.g + p.r - p.b),
        _ => return Err(anyhow!("Unknown index formula: '{formula}'")),
    };
    let mut sum = 0.0;
    let mut count = 0usize;
    for pixel in &frame.pixels {
        let (numerator, denominator) = per_pixel(pixel);
        if denominator.abs() < f64::EPSILON {
            continue;
        }
        sum += numerator / denominator;
        count += 1;
    }
    if count == 0 {
        return Err(anyhow!("No evaluable pixel for formula '{formula}'"));
    }
    Ok(sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_frame(pixel: Pixel) -> PixelFrame {
        PixelFrame::new(2, 2, vec![pixel; 4])
    }

    #[test]
    fn mpri_of_green_frame_is_positive() {
        let frame = uniform_frame(Pixel {
            r: 0.2,
            g: 0.6,
            b: 0.1,
            nir: 0.0,
        });
        let mpri = image_mean_of_formula(&frame, HealthIndex::Mpri.formula()).unwrap();
        assert!((mpri - 0.5).abs() < 1e-9);
        let ndrgi = image_mean_of_formula(&frame, HealthIndex::Ndrgi.formula()).unwrap();
        assert!((ndrgi + 0.5).abs() < 1e-9);
    }

    #[test]
    fn ndvi_uses_the_nir_channel() {
        let frame = uniform_frame(Pixel {
            r: 0.25,
            g: 0.0,
            b: 0.0,
            nir: 0.75,
        });
        let ndvi = image_mean_of_formula(&frame, HealthIndex::Ndvi.formula()).unwrap();
        assert!((ndvi - 0.5).abs() < 1e-9);
    }

    #[test]
    fn vanishing_denominators_are_skipped() {
        let mut pixels = vec![
            Pixel {
                r: 0.2,
                g: 0.6,
                b: 0.1,
                nir: 0.0,
            };
            3
        ];
        pixels.push(Pixel::default()); // all-zero pixel: no denominator
        let frame = PixelFrame::new(2, 2, pixels);
        let mpri = image_mean_of_formula(&frame, HealthIndex::Mpri.formula()).unwrap();
        assert!((mpri - 0.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_formula_is_an_error() {
        let frame = uniform_frame(Pixel::default());
        assert!(image_mean_of_formula(&frame, "(r*g)/b").is_err());
    }
}

//! Channel images and the working region.

use std::sync::Arc;

use emseg_core::{
    BoxWalker, RegionBox, Result, ScalarType, ScalarVolume, SegmentationError, Volume, VoxelBox,
};
use emseg_model::{HierarchyNode, SuperClass};

/// Images to segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentationInput {
    /// One volume per channel; all share dimensions and spacing.
    pub channels: Vec<Arc<ScalarVolume>>,
    /// Working region (1-based, inclusive). Falls back to the root's
    /// segmentation boundary, then to the whole image.
    pub region: Option<RegionBox>,
    /// Pre-existing label mask over the whole image; the root level only
    /// segments voxels where it is non-zero.
    pub roi_mask: Option<Arc<Volume<i32>>>,
}

impl SegmentationInput {
    pub fn new(channels: Vec<Arc<ScalarVolume>>) -> Self {
        Self {
            channels,
            region: None,
            roi_mask: None,
        }
    }

    pub fn with_channel(mut self, channel: Arc<ScalarVolume>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn with_region(mut self, region: RegionBox) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_roi_mask(mut self, mask: Arc<Volume<i32>>) -> Self {
        self.roi_mask = Some(mask);
        self
    }
}

/// Log-intensity input over the working region, read once before any level
/// runs.
#[derive(Debug, Clone)]
pub(crate) struct PreparedInput {
    pub dims: [usize; 3],
    pub boundary: VoxelBox,
    /// `log(v + 1)` for positive intensities, `0` otherwise; one buffer per
    /// channel over `boundary`, x fastest.
    pub log_intensity: Vec<Vec<f64>>,
    /// Root ROI over `boundary`; `None` means every voxel.
    pub root_roi: Option<Vec<bool>>,
}

impl PreparedInput {
    pub fn channel_count(&self) -> usize {
        self.log_intensity.len()
    }

    pub fn voxel_count(&self) -> usize {
        self.boundary.voxel_count()
    }

    /// Check the channels against each other and against the tree, then
    /// read the log intensities.
    pub fn prepare(input: &SegmentationInput, root: &SuperClass) -> Result<Self> {
        let first = input
            .channels
            .first()
            .ok_or_else(|| SegmentationError::input_mismatch("no input channels"))?;
        let dims = first.dims();
        let spacing = first.spacing();
        let scalar_type = first.scalar_type();
        for (index, channel) in input.channels.iter().enumerate().skip(1) {
            if channel.scalar_type() != scalar_type {
                return Err(SegmentationError::input_mismatch(format!(
                    "channel {} is {}, channel 0 is {}",
                    index,
                    channel.scalar_type(),
                    scalar_type
                )));
            }
            if channel.dims() != dims {
                return Err(SegmentationError::input_mismatch(format!(
                    "channel {} has dimensions {:?}, channel 0 has {:?}",
                    index,
                    channel.dims(),
                    dims
                )));
            }
            if !channel.spacing().matches(&spacing) {
                return Err(SegmentationError::input_mismatch(format!(
                    "channel {} has spacing {:?}, channel 0 has {:?}",
                    index,
                    channel.spacing().0,
                    spacing.0
                )));
            }
        }
        if let Some(leaf) = root
            .leaves()
            .into_iter()
            .find(|leaf| leaf.channel_count() != input.channels.len())
        {
            return Err(SegmentationError::input_mismatch(format!(
                "class '{}' models {} channels but {} were given",
                leaf.name,
                leaf.channel_count(),
                input.channels.len()
            )));
        }

        check_atlases(root, dims, scalar_type)?;

        let region = input
            .region
            .or(root.segmentation_boundary)
            .unwrap_or_else(|| RegionBox::full(dims));
        region.validate_against(dims)?;
        let boundary = region.to_voxel_box();

        let log_intensity = input
            .channels
            .iter()
            .map(|channel| {
                BoxWalker::full(boundary)
                    .map(|v| {
                        let [x, y, z] = v.pos;
                        let value = channel.get(x, y, z);
                        if value > 0.0 {
                            (value + 1.0).ln()
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect();

        let root_roi = match &input.roi_mask {
            Some(mask) if mask.dims() != dims => {
                return Err(SegmentationError::input_mismatch(format!(
                    "ROI mask has dimensions {:?}, the channels have {:?}",
                    mask.dims(),
                    dims
                )))
            }
            Some(mask) => Some(
                BoxWalker::full(boundary)
                    .map(|v| mask.get(v.pos[0], v.pos[1], v.pos[2]) != 0)
                    .collect(),
            ),
            None => None,
        };

        Ok(Self {
            dims,
            boundary,
            log_intensity,
            root_roi,
        })
    }

    /// Whether the voxel at box-local `index` belongs to the root ROI.
    pub fn in_root_roi(&self, index: usize) -> bool {
        self.root_roi.as_ref().map_or(true, |roi| roi[index])
    }

    /// Intensity vector of the voxel at box-local `index`, bias removed.
    #[inline]
    pub fn corrected(&self, index: usize, bias: &[Vec<f64>], out: &mut [f64]) {
        for (c, value) in out.iter_mut().enumerate() {
            *value = self.log_intensity[c][index] - bias[c][index];
        }
    }
}

/// Every probability map and shape model must cover the image, and every
/// probability map must share the channels' scalar type.
fn check_atlases(node: &SuperClass, dims: [usize; 3], scalar_type: ScalarType) -> Result<()> {
    let check_map = |name: &str, map: &ScalarVolume| {
        if map.dims() != dims {
            return Err(SegmentationError::input_mismatch(format!(
                "'{}': probability map has dimensions {:?}, the channels have {:?}",
                name,
                map.dims(),
                dims
            )));
        }
        if map.scalar_type() != scalar_type {
            return Err(SegmentationError::input_mismatch(format!(
                "'{}': probability map is {}, the channels are {}",
                name,
                map.scalar_type(),
                scalar_type
            )));
        }
        Ok(())
    };
    if let Some(map) = &node.prob_data {
        check_map(&node.name, map.as_ref())?;
    }
    for child in node.children().iter().flatten() {
        match child {
            HierarchyNode::SuperClass(sub) => check_atlases(sub, dims, scalar_type)?,
            HierarchyNode::Class(class) => {
                if let Some(map) = &class.prob_data {
                    check_map(&class.name, map.as_ref())?;
                }
                if let Some(model) = &class.shape_model {
                    if model.dims() != dims {
                        return Err(SegmentationError::input_mismatch(format!(
                            "'{}': shape model has dimensions {:?}, the channels have {:?}",
                            class.name,
                            model.dims(),
                            dims
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use emseg_core::{Spacing, Volume};
    use emseg_model::TissueClass;

    fn root(channels: usize) -> SuperClass {
        SuperClass::new("root")
            .with_child(TissueClass::new("a", 1, channels))
            .with_child(TissueClass::new("b", 2, channels))
    }

    fn channel(dims: [usize; 3], value: f32) -> Arc<ScalarVolume> {
        Arc::new(ScalarVolume::from(Volume::filled(dims, value)))
    }

    #[test]
    fn test_log_intensity() {
        let image = Volume::from_fn([3, 1, 1], |x, _, _| [0.0f32, -4.0, 9.0][x]);
        let input = SegmentationInput::new(vec![Arc::new(ScalarVolume::from(image))]);
        let prepared = PreparedInput::prepare(&input, &root(1)).unwrap();
        assert_eq!(prepared.log_intensity[0], vec![0.0, 0.0, 10f64.ln()]);
        assert_eq!(prepared.boundary, VoxelBox::full([3, 1, 1]));
    }

    #[test]
    fn test_region_restricts_the_boundary() {
        let input = SegmentationInput::new(vec![channel([4, 4, 2], 1.0)])
            .with_region(RegionBox::new([2, 2, 1], [3, 4, 1]).unwrap());
        let prepared = PreparedInput::prepare(&input, &root(1)).unwrap();
        assert_eq!(prepared.boundary, VoxelBox::new([1, 1, 0], [2, 3, 0]));
        assert_eq!(prepared.voxel_count(), 6);
    }

    #[test]
    fn test_input_mismatches() {
        let empty = SegmentationInput::default();
        assert!(matches!(
            PreparedInput::prepare(&empty, &root(1)),
            Err(SegmentationError::InputMismatch(_))
        ));

        let dims = SegmentationInput::new(vec![channel([4, 4, 1], 1.0), channel([4, 3, 1], 1.0)]);
        assert!(PreparedInput::prepare(&dims, &root(2)).is_err());

        let spaced = Arc::new(ScalarVolume::from(
            Volume::filled([4, 4, 1], 1.0f32).with_spacing(Spacing([1.0, 1.0, 2.0])),
        ));
        let spacing = SegmentationInput::new(vec![channel([4, 4, 1], 1.0), spaced]);
        assert!(PreparedInput::prepare(&spacing, &root(2)).is_err());

        let count = SegmentationInput::new(vec![channel([4, 4, 1], 1.0)]);
        assert!(PreparedInput::prepare(&count, &root(2)).is_err());

        let region = SegmentationInput::new(vec![channel([4, 4, 1], 1.0)])
            .with_region(RegionBox::new([1, 1, 1], [5, 4, 1]).unwrap());
        assert!(PreparedInput::prepare(&region, &root(1)).is_err());
    }

    #[test]
    fn test_roi_mask_and_atlas_checks() {
        let mask = Volume::from_fn([2, 2, 1], |x, _, _| x as i32);
        let input = SegmentationInput::new(vec![channel([2, 2, 1], 1.0)]).with_roi_mask(Arc::new(mask));
        let prepared = PreparedInput::prepare(&input, &root(1)).unwrap();
        assert_eq!(prepared.root_roi, Some(vec![false, true, false, true]));
        assert!(prepared.in_root_roi(1) && !prepared.in_root_roi(2));

        let small = SegmentationInput::new(vec![channel([2, 2, 1], 1.0)])
            .with_roi_mask(Arc::new(Volume::filled([2, 1, 1], 1)));
        assert!(PreparedInput::prepare(&small, &root(1)).is_err());

        let atlas = SuperClass::new("root")
            .with_child(TissueClass::new("a", 1, 1).with_prob_data(channel([3, 2, 1], 1.0), 1.0))
            .with_child(TissueClass::new("b", 2, 1));
        let input = SegmentationInput::new(vec![channel([2, 2, 1], 1.0)]);
        let err = PreparedInput::prepare(&input, &atlas).unwrap_err();
        assert!(err.to_string().contains("'a'"));
    }
}

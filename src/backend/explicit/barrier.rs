// Resource state tracking and barriers
//
// Every subresource sits in `ShaderReadable` between operations. A copy or
// an unordered-access dispatch moves the subresources it touches into the
// operation state, runs, then moves them back. Transitions are planned
// first and recorded only after their barriers were submitted;
// `image_barrier`/`buffer_barrier` turn them into Vulkan barriers.

use ash::vk;
use parking_lot::Mutex;

use crate::types::TextureParam;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Freshly created, contents undefined
    Undefined,
    ShaderReadable,
    CopySource,
    CopyDest,
    UnorderedAccess,
}

impl ResourceState {
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
            ResourceState::ShaderReadable => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ResourceState::UnorderedAccess => vk::ImageLayout::GENERAL,
        }
    }

    pub fn access(self) -> vk::AccessFlags {
        match self {
            ResourceState::Undefined => vk::AccessFlags::empty(),
            ResourceState::ShaderReadable => vk::AccessFlags::SHADER_READ | vk::AccessFlags::UNIFORM_READ,
            ResourceState::CopySource => vk::AccessFlags::TRANSFER_READ,
            ResourceState::CopyDest => vk::AccessFlags::TRANSFER_WRITE,
            ResourceState::UnorderedAccess => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        }
    }

    pub fn stage(self) -> vk::PipelineStageFlags {
        match self {
            ResourceState::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            ResourceState::ShaderReadable | ResourceState::UnorderedAccess => {
                vk::PipelineStageFlags::COMPUTE_SHADER
            }
            ResourceState::CopySource | ResourceState::CopyDest => vk::PipelineStageFlags::TRANSFER,
        }
    }
}

/// One subresource changing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub subresource: u32,
    pub from: ResourceState,
    pub to: ResourceState,
}

/// Current state of every subresource of one resource
#[derive(Debug, Clone)]
pub struct SubresourceStates {
    states: Vec<ResourceState>,
}

impl SubresourceStates {
    pub fn new(count: u32, initial: ResourceState) -> Self {
        Self {
            states: vec![initial; count as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn get(&self, subresource: u32) -> Option<ResourceState> {
        self.states.get(subresource as usize).copied()
    }

    pub fn all(&self) -> Vec<u32> {
        (0..self.states.len() as u32).collect()
    }

    /// Transitions that would move `subresources` to `to`, without recording
    /// them. Subresources already there produce no transition; unknown
    /// indices are ignored.
    pub fn plan(&self, subresources: &[u32], to: ResourceState) -> Vec<Transition> {
        let mut transitions = Vec::new();

        for &subresource in subresources {
            let Some(&from) = self.states.get(subresource as usize) else {
                continue;
            };

            if from != to && !transitions.iter().any(|t: &Transition| t.subresource == subresource) {
                transitions.push(Transition { subresource, from, to });
            }
        }

        transitions
    }

    /// Record `transitions` as done
    pub fn apply(&mut self, transitions: &[Transition]) {
        for transition in transitions {
            if let Some(state) = self.states.get_mut(transition.subresource as usize) {
                *state = transition.to;
            }
        }
    }

    pub fn is_at_rest(&self) -> bool {
        self.states.iter().all(|s| *s == ResourceState::ShaderReadable)
    }
}

/// Subresources of one tracked resource heading to a new state
pub struct Move<'a> {
    pub states: &'a Mutex<SubresourceStates>,
    pub subresources: &'a [u32],
    pub to: ResourceState,
}

/// Plan every move, hand the transitions to `submit`, and record them only
/// once `submit` succeeds. On failure the tracked states are left as they
/// were, matching the resources on the device.
pub fn commit<E>(
    moves: &[Move<'_>],
    submit: impl FnOnce(&[Vec<Transition>]) -> Result<(), E>,
) -> Result<(), E> {
    let planned: Vec<Vec<Transition>> = moves
        .iter()
        .map(|m| m.states.lock().plan(m.subresources, m.to))
        .collect();

    submit(&planned)?;

    for (m, transitions) in moves.iter().zip(&planned) {
        m.states.lock().apply(transitions);
    }

    Ok(())
}

/// Union of source and destination stages of `transitions`
pub fn stage_masks<'a>(
    transitions: impl IntoIterator<Item = &'a Transition>,
) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
    transitions.into_iter().fold(
        (vk::PipelineStageFlags::empty(), vk::PipelineStageFlags::empty()),
        |(src, dst), t| (src | t.from.stage(), dst | t.to.stage()),
    )
}

pub fn image_barrier(image: vk::Image, desc: &TextureParam, transition: &Transition) -> vk::ImageMemoryBarrier {
    let face = transition.subresource / desc.num_mips;
    let mip = transition.subresource % desc.num_mips;

    vk::ImageMemoryBarrier::builder()
        .src_access_mask(transition.from.access())
        .dst_access_mask(transition.to.access())
        .old_layout(transition.from.layout())
        .new_layout(transition.to.layout())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(super::buffer::color_range(mip, 1, face, 1))
        .build()
}

pub fn buffer_barrier(buffer: vk::Buffer, transition: &Transition) -> vk::BufferMemoryBarrier {
    vk::BufferMemoryBarrier::builder()
        .src_access_mask(transition.from.access())
        .dst_access_mask(transition.to.access())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Format, ViewFlags};

    fn step(states: &mut SubresourceStates, subresources: &[u32], to: ResourceState) -> Vec<Transition> {
        let transitions = states.plan(subresources, to);
        states.apply(&transitions);
        transitions
    }

    #[test]
    fn round_trip_returns_to_rest() {
        let mut states = SubresourceStates::new(4, ResourceState::ShaderReadable);

        let forward = step(&mut states, &[1, 2], ResourceState::CopyDest);
        assert_eq!(forward.len(), 2);
        assert_eq!(states.get(1), Some(ResourceState::CopyDest));
        assert_eq!(states.get(0), Some(ResourceState::ShaderReadable));
        assert!(!states.is_at_rest());

        let back = step(&mut states, &[1, 2], ResourceState::ShaderReadable);
        assert_eq!(
            back,
            vec![
                Transition { subresource: 1, from: ResourceState::CopyDest, to: ResourceState::ShaderReadable },
                Transition { subresource: 2, from: ResourceState::CopyDest, to: ResourceState::ShaderReadable },
            ]
        );
        assert!(states.is_at_rest());
    }

    #[test]
    fn redundant_transitions_are_skipped() {
        let mut states = SubresourceStates::new(2, ResourceState::ShaderReadable);
        assert!(step(&mut states, &[0, 1], ResourceState::ShaderReadable).is_empty());

        step(&mut states, &[0], ResourceState::UnorderedAccess);
        let second = step(&mut states, &[0, 1], ResourceState::UnorderedAccess);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].subresource, 1);
    }

    #[test]
    fn out_of_range_subresources_are_ignored() {
        let mut states = SubresourceStates::new(1, ResourceState::Undefined);
        let transitions = step(&mut states, &[0, 5], ResourceState::CopyDest);
        assert_eq!(transitions.len(), 1);
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn planning_does_not_record() {
        let states = SubresourceStates::new(3, ResourceState::ShaderReadable);
        let planned = states.plan(&[0, 2, 2], ResourceState::CopySource);

        assert_eq!(planned.len(), 2);
        assert!(states.is_at_rest());
    }

    #[test]
    fn failed_submit_leaves_states_untouched() {
        let texture = Mutex::new(SubresourceStates::new(4, ResourceState::ShaderReadable));
        let buffer = Mutex::new(SubresourceStates::new(1, ResourceState::ShaderReadable));
        let moves = [
            Move { states: &texture, subresources: &[1, 3], to: ResourceState::CopyDest },
            Move { states: &buffer, subresources: &[0], to: ResourceState::CopySource },
        ];

        let mut seen = 0;
        let result: Result<(), &str> = commit(&moves, |transitions| {
            seen = transitions.iter().map(Vec::len).sum();
            Err("device lost")
        });

        assert_eq!(result, Err("device lost"));
        assert_eq!(seen, 3);
        assert!(texture.lock().is_at_rest());
        assert!(buffer.lock().is_at_rest());

        // The next attempt still sees the true starting layout
        let retry: Result<(), &str> = commit(&moves, |transitions| {
            assert_eq!(transitions[0][0].from, ResourceState::ShaderReadable);
            Ok(())
        });

        assert!(retry.is_ok());
        assert_eq!(texture.lock().get(1), Some(ResourceState::CopyDest));
        assert_eq!(texture.lock().get(0), Some(ResourceState::ShaderReadable));
        assert_eq!(buffer.lock().get(0), Some(ResourceState::CopySource));
    }

    #[test]
    fn stage_masks_cover_both_sides() {
        let transitions = [
            Transition { subresource: 0, from: ResourceState::ShaderReadable, to: ResourceState::CopySource },
            Transition { subresource: 1, from: ResourceState::Undefined, to: ResourceState::UnorderedAccess },
        ];

        let (src, dst) = stage_masks(&transitions);
        assert_eq!(src, vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(dst, vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COMPUTE_SHADER);
    }

    #[test]
    fn image_barrier_targets_face_and_mip() {
        let desc = TextureParam::new_cube(16, 3, Format::Rgba16Float, ViewFlags::SRV);
        let index = desc.subresource_index(4, 2);
        let transition = Transition { subresource: index, from: ResourceState::ShaderReadable, to: ResourceState::CopySource };

        let barrier = image_barrier(vk::Image::null(), &desc, &transition);
        assert_eq!(barrier.subresource_range.base_array_layer, 4);
        assert_eq!(barrier.subresource_range.base_mip_level, 2);
        assert_eq!(barrier.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    }
}

use std::fmt;

use burn::prelude::*;

use crate::{
    model::Model,
    preprocess::{self, TestSample, IMAGE_SIZE},
};

/// Scores above this are dogs; anything else, including the boundary, is a cat.
pub const THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Cat,
    Dog,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Label::Cat => "cat",
            Label::Dog => "dog",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prediction {
    Classified {
        label: Label,
        /// Percentage in [50, 100].
        confidence: f32,
    },
    NoImageLoaded,
}

impl Prediction {
    /// Threshold a sigmoid output into a label and a confidence percentage.
    pub fn from_score(score: f32) -> Self {
        let (label, confidence) = if score > THRESHOLD {
            (Label::Dog, score)
        } else {
            (Label::Cat, 1.0 - score)
        };

        Prediction::Classified {
            label,
            confidence: confidence * 100.,
        }
    }

    pub fn label(&self) -> Option<Label> {
        match self {
            Prediction::Classified { label, .. } => Some(*label),
            Prediction::NoImageLoaded => None,
        }
    }

    pub fn confidence(&self) -> Option<f32> {
        match self {
            Prediction::Classified { confidence, .. } => Some(*confidence),
            Prediction::NoImageLoaded => None,
        }
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prediction::Classified { label, confidence } => {
                write!(f, "Class: {label}, Confidence: {confidence:.2}%")
            }
            Prediction::NoImageLoaded => f.write_str("No image loaded"),
        }
    }
}

/// Sigmoid output of `model` for a single sample.
pub fn score<B: Backend>(sample: &TestSample, model: &Model<B>, device: &B::Device) -> f32 {
    let input = preprocess::to_tensor::<B>(&sample.tensor, device).reshape([
        1,
        3,
        IMAGE_SIZE,
        IMAGE_SIZE,
    ]);

    model
        .forward_probability(input)
        .into_scalar()
        .elem::<f32>()
}

/// Classify `sample`; a missing sample is reported, not raised.
pub fn classify<B: Backend>(
    sample: Option<&TestSample>,
    model: &Model<B>,
    device: &B::Device,
) -> Prediction {
    match sample {
        Some(sample) => Prediction::from_score(score(sample, model, device)),
        None => Prediction::NoImageLoaded,
    }
}

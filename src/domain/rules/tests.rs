// Unit tests for business rules

use super::*;

#[test]
fn test_bitrate_table() {
    assert_eq!(BitratePolicy::resolve(QualityPreset::High).bits_per_second(), 1_000_000);
    assert_eq!(BitratePolicy::resolve(QualityPreset::Medium).bits_per_second(), 600_000);
    assert_eq!(BitratePolicy::resolve(QualityPreset::Low).bits_per_second(), 400_000);
}

#[test]
fn test_bitrate_is_monotonic_in_preset() {
    for lower in QualityPreset::ALL {
        for higher in QualityPreset::ALL {
            let (a, b) = (BitratePolicy::resolve(lower), BitratePolicy::resolve(higher));
            if lower < higher {
                assert!(a < b, "{} should resolve below {}", lower, higher);
            } else if lower == higher {
                assert_eq!(a, b);
            }
        }
    }
}

#[test]
fn test_bitrate_is_strictly_positive() {
    for preset in QualityPreset::ALL {
        assert!(BitratePolicy::resolve(preset).bits_per_second() > 0);
    }
}

#[test]
fn test_estimate_output_size() {
    // 400 kbps for 10 s is 4,000,000 bits
    assert_eq!(estimate_output_size(BitratePolicy::LOW, 10.0), 500_000);
    assert_eq!(estimate_output_size(BitratePolicy::HIGH, 2.5), 312_500);
    assert_eq!(estimate_output_size(BitratePolicy::HIGH, -1.0), 0);
}

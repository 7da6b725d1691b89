//! Control-plane parameter tests (`sched_ctl`, `sched_adjdom`)

use hvsched::scheduler::policies::rrobin::{RR_DEFAULT_SLICE, SCHED_RROBIN};
use hvsched::scheduler::types::STime;
use hvsched::scheduler::{
    AdjdomParams, DomainConfig, SchedAdjdomCmd, SchedCtlCmd, SchedCtlParams, SchedError,
    SchedInfoDirection,
};

use super::{ms, set_rr_slice, vcpu};
use crate::mock::Harness;

fn rr_get(h: &Harness, domain: u16) -> Result<STime, SchedError> {
    let mut cmd = SchedAdjdomCmd {
        sched_id: SCHED_RROBIN,
        domain,
        direction: SchedInfoDirection::Get,
        params: AdjdomParams::Rrobin { slice: 0 },
    };
    h.on_cpu(0, |s| s.sched_adjdom(&mut cmd))?;
    match cmd.params {
        AdjdomParams::Rrobin { slice } => Ok(slice),
        other => panic!("unexpected params {:?}", other),
    }
}

fn rr_ctl(h: &Harness, direction: SchedInfoDirection, default_slice: STime) -> Result<STime, SchedError> {
    let mut cmd = SchedCtlCmd {
        sched_id: SCHED_RROBIN,
        direction,
        params: SchedCtlParams::Rrobin { default_slice },
    };
    h.on_cpu(0, |s| s.sched_ctl(&mut cmd))?;
    match cmd.params {
        SchedCtlParams::Rrobin { default_slice } => Ok(default_slice),
        other => panic!("unexpected params {:?}", other),
    }
}

// ============================================================================
// Request validation
// ============================================================================

#[test]
fn test_adjdom_rejects_foreign_sched_id() {
    let h = Harness::new(2, "rrobin");
    h.guest(DomainConfig::new(1, 1).on_cpu(1));

    let mut cmd = SchedAdjdomCmd {
        sched_id: SCHED_RROBIN + 1,
        domain: 1,
        direction: SchedInfoDirection::Get,
        params: AdjdomParams::Rrobin { slice: 0 },
    };
    assert_eq!(
        h.on_cpu(0, |s| s.sched_adjdom(&mut cmd)),
        Err(SchedError::InvalidArgument)
    );
}

#[test]
fn test_adjdom_unknown_domain() {
    let h = Harness::new(2, "rrobin");
    assert_eq!(rr_get(&h, 42), Err(SchedError::NoSuchDomain));
}

#[test]
fn test_adjdom_param_kind_must_match_policy() {
    let h = Harness::new(2, "rrobin");
    h.guest(DomainConfig::new(1, 1).on_cpu(1));

    let mut cmd = SchedAdjdomCmd {
        sched_id: SCHED_RROBIN,
        domain: 1,
        direction: SchedInfoDirection::Put,
        params: AdjdomParams::Credit { weight: 512, cap: 0 },
    };
    assert_eq!(
        h.on_cpu(0, |s| s.sched_adjdom(&mut cmd)),
        Err(SchedError::InvalidArgument)
    );
}

#[test]
fn test_sched_ctl_rejects_foreign_sched_id() {
    let h = Harness::new(2, "rrobin");
    let mut cmd = SchedCtlCmd {
        sched_id: 99,
        direction: SchedInfoDirection::Get,
        params: SchedCtlParams::Rrobin { default_slice: 0 },
    };
    assert_eq!(h.sched.sched_ctl(&mut cmd), Err(SchedError::InvalidArgument));
}

// ============================================================================
// Round-robin parameters
// ============================================================================

#[test]
fn test_rrobin_slice_get_put() {
    let h = Harness::new(2, "rrobin");
    let d = h.guest(DomainConfig::new(1, 2).on_cpu(1));
    h.softirq_all();

    assert_eq!(rr_get(&h, 1), Ok(RR_DEFAULT_SLICE));
    set_rr_slice(&h, &d, ms(25));
    assert_eq!(rr_get(&h, 1), Ok(ms(25)));
}

#[test]
fn test_rrobin_slice_out_of_range() {
    let h = Harness::new(2, "rrobin");
    h.guest(DomainConfig::new(1, 1).on_cpu(1));

    for slice in [0, ms(1) - 1, ms(1000) + 1, -ms(5)] {
        let mut cmd = SchedAdjdomCmd {
            sched_id: SCHED_RROBIN,
            domain: 1,
            direction: SchedInfoDirection::Put,
            params: AdjdomParams::Rrobin { slice },
        };
        assert_eq!(
            h.on_cpu(0, |s| s.sched_adjdom(&mut cmd)),
            Err(SchedError::InvalidArgument),
            "slice {}",
            slice
        );
    }
    assert_eq!(rr_get(&h, 1), Ok(RR_DEFAULT_SLICE));
}

#[test]
fn test_rrobin_default_slice_applies_to_new_domains() {
    let h = Harness::new(2, "rrobin");
    h.guest(DomainConfig::new(1, 1).on_cpu(1));

    assert_eq!(rr_ctl(&h, SchedInfoDirection::Get, 0), Ok(RR_DEFAULT_SLICE));
    assert_eq!(rr_ctl(&h, SchedInfoDirection::Put, ms(3)), Ok(ms(3)));
    assert_eq!(rr_ctl(&h, SchedInfoDirection::Get, 0), Ok(ms(3)));
    assert_eq!(
        rr_ctl(&h, SchedInfoDirection::Put, 0),
        Err(SchedError::InvalidArgument)
    );

    h.guest(DomainConfig::new(2, 1).on_cpu(1));
    assert_eq!(rr_get(&h, 1), Ok(RR_DEFAULT_SLICE), "existing domain keeps its slice");
    assert_eq!(rr_get(&h, 2), Ok(ms(3)));
}

#[test]
fn test_adjdom_restores_pause_counts() {
    let h = Harness::new(3, "rrobin");
    let d = h.guest(DomainConfig::new(1, 2).on_cpu(1));
    h.softirq_all();

    set_rr_slice(&h, &d, ms(7));
    for v in d.vcpus() {
        assert_eq!(v.pause_count(), 0, "{}", v);
        assert!(v.is_runnable(), "{}", v);
    }
    assert_eq!(d.pause_count(), 0);

    h.softirq_all();
    assert_eq!(h.sched.curr_on(1).domain_id(), 1);
    assert_eq!(h.sched.curr_on(2).domain_id(), 1);
}

#[test]
fn test_adjdom_failure_still_unpauses() {
    let h = Harness::new(2, "rrobin");
    let d = h.guest(DomainConfig::new(1, 1).on_cpu(1));
    h.softirq_all();

    let mut cmd = SchedAdjdomCmd {
        sched_id: SCHED_RROBIN,
        domain: 1,
        direction: SchedInfoDirection::Put,
        params: AdjdomParams::Rrobin { slice: 0 },
    };
    assert!(h.on_cpu(0, |s| s.sched_adjdom(&mut cmd)).is_err());

    let v = vcpu(&d, 0);
    assert_eq!(v.pause_count(), 0);
    assert!(v.is_runnable());
}

// ============================================================================
// Credit parameters
// ============================================================================

#[cfg(feature = "sched_credit")]
mod credit {
    use hvsched::scheduler::policies::credit::{
        CSCHED_CAP_UNCHANGED, CSCHED_DEFAULT_TSLICE, CSCHED_DEFAULT_WEIGHT, SCHED_CREDIT,
    };

    use super::*;

    fn credit_adjdom(
        h: &Harness,
        domain: u16,
        direction: SchedInfoDirection,
        weight: u16,
        cap: u16,
    ) -> Result<(u16, u16), SchedError> {
        let mut cmd = SchedAdjdomCmd {
            sched_id: SCHED_CREDIT,
            domain,
            direction,
            params: AdjdomParams::Credit { weight, cap },
        };
        h.on_cpu(0, |s| s.sched_adjdom(&mut cmd))?;
        match cmd.params {
            AdjdomParams::Credit { weight, cap } => Ok((weight, cap)),
            other => panic!("unexpected params {:?}", other),
        }
    }

    fn get(h: &Harness, domain: u16) -> (u16, u16) {
        credit_adjdom(h, domain, SchedInfoDirection::Get, 0, 0).expect("get")
    }

    #[test]
    fn test_credit_defaults() {
        let h = Harness::new(2, "credit");
        h.guest(DomainConfig::new(1, 1).on_cpu(1));
        assert_eq!(get(&h, 1), (CSCHED_DEFAULT_WEIGHT, 0));
    }

    #[test]
    fn test_credit_put_weight_and_cap() {
        let h = Harness::new(2, "credit");
        h.guest(DomainConfig::new(1, 1).on_cpu(1));

        credit_adjdom(&h, 1, SchedInfoDirection::Put, 512, 40).unwrap();
        assert_eq!(get(&h, 1), (512, 40));
    }

    #[test]
    fn test_credit_put_sentinels_leave_values() {
        let h = Harness::new(2, "credit");
        h.guest(DomainConfig::new(1, 1).on_cpu(1));
        credit_adjdom(&h, 1, SchedInfoDirection::Put, 300, 20).unwrap();

        // weight 0 keeps the weight, CAP_UNCHANGED keeps the cap
        credit_adjdom(&h, 1, SchedInfoDirection::Put, 0, CSCHED_CAP_UNCHANGED).unwrap();
        assert_eq!(get(&h, 1), (300, 20));

        // cap 0 removes the cap
        credit_adjdom(&h, 1, SchedInfoDirection::Put, 0, 0).unwrap();
        assert_eq!(get(&h, 1), (300, 0));
    }

    #[test]
    fn test_credit_rejects_rrobin_params() {
        let h = Harness::new(2, "credit");
        h.guest(DomainConfig::new(1, 1).on_cpu(1));

        let mut cmd = SchedAdjdomCmd {
            sched_id: SCHED_CREDIT,
            domain: 1,
            direction: SchedInfoDirection::Get,
            params: AdjdomParams::Rrobin { slice: 0 },
        };
        assert_eq!(
            h.on_cpu(0, |s| s.sched_adjdom(&mut cmd)),
            Err(SchedError::InvalidArgument)
        );
    }

    #[test]
    fn test_credit_tslice_ctl() {
        let h = Harness::new(2, "credit");
        let mut cmd = SchedCtlCmd {
            sched_id: SCHED_CREDIT,
            direction: SchedInfoDirection::Get,
            params: SchedCtlParams::Credit { tslice: 0 },
        };
        h.sched.sched_ctl(&mut cmd).unwrap();
        assert_eq!(cmd.params, SchedCtlParams::Credit { tslice: CSCHED_DEFAULT_TSLICE });

        cmd.direction = SchedInfoDirection::Put;
        cmd.params = SchedCtlParams::Credit { tslice: ms(5) };
        h.sched.sched_ctl(&mut cmd).unwrap();

        cmd.params = SchedCtlParams::Credit { tslice: 0 };
        assert_eq!(h.sched.sched_ctl(&mut cmd), Err(SchedError::InvalidArgument));

        cmd.direction = SchedInfoDirection::Get;
        h.sched.sched_ctl(&mut cmd).unwrap();
        assert_eq!(cmd.params, SchedCtlParams::Credit { tslice: ms(5) });
    }
}

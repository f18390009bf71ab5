#[macro_export]
macro_rules! must_let {
    (let $pat:pat = $expr:expr) => {
        let $pat = $expr else {
            panic!(
                "must_let failed: `{}` does not match pattern `{}`",
                stringify!($expr),
                stringify!($pat)
            );
        };
    };
}

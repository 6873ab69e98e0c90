mod fixture;

mod captures;
mod outputs;

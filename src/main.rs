fn main() {
    proctorwatch_lib::run()
}
